//! Queue position of pending jobs within their scope.

use super::QueueService;
use crate::access::Actor;
use crate::error::QueueResult;
use crate::model::{JobId, JobStatus};

impl QueueService {
    /// 1-based rank of a pending job among pending peers in its scope.
    ///
    /// Peers share the material when the job has one, otherwise the course.
    /// Returns `None` for jobs that are not pending or have no scope. Always
    /// recomputed from the store.
    ///
    /// # Errors
    ///
    /// Same visibility errors as [`QueueService::get`].
    pub async fn position(&self, id: &JobId, actor: &Actor) -> QueueResult<Option<u64>> {
        let job = self.get(id, actor).await?;
        if job.status != JobStatus::Pending {
            return Ok(None);
        }
        let Some(scope) = &job.scope else {
            return Ok(None);
        };
        let ahead = self.store.pending_ahead(id, &scope.ranking_key()).await?;
        Ok(Some(ahead + 1))
    }
}
