//! Job queue and review workflow service.
//!
//! Turns exercise submissions into tracked jobs that are either executed
//! automatically or claimed by exactly one human grader, moves them through a
//! forward-only state machine, and supports age-gated retries that keep the
//! full lineage of attempts.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod access;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod model;
pub mod services;
pub mod shutdown;
pub mod state_machine;
pub mod store;

pub use access::{Actor, Authority, CachedEnrollments, Enrollments, Role, SqliteEnrollments};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::QueueServiceConfig;
pub use error::{QueueError, QueueResult};
pub use model::{Job, JobId, JobPayload, JobStatus, JobType, NewJob, Outcome, Scope};
pub use services::{JobProducer, QueueService};
pub use store::{JobFilter, JobStore, SqliteJobStore};
