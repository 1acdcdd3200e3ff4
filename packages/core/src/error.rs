//! Error taxonomy for producer and query operations.

use crate::job::{JobId, JobStatus};

/// Errors surfaced synchronously to callers of the job API.
///
/// The infrastructure variants carry their detail for logging only; the HTTP
/// layer never returns it to the client.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("job {id} is {status} and cannot be cancelled")]
    NotCancellable { id: JobId, status: JobStatus },

    #[error("job {id} is {status}; results are only available once completed")]
    NotCompleted { id: JobId, status: JobStatus },

    #[error("job store error: {0}")]
    Store(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("object storage error: {0}")]
    Storage(String),
}
