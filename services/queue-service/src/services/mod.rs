//! Queue workflows: claiming, completion, retries, positions and job intake.

mod position;
mod producer;
mod queue;
mod retry;

pub use producer::JobProducer;
pub use queue::QueueService;
