//! Error taxonomy shared by the job control surface, the ingestion path and the sampler.

use thiserror::Error;

use crate::domain::job::JobStatus;

/// Errors surfaced by task orchestration, ingestion and sampling.
///
/// `InvalidTransition`, `PreconditionFailed` and `NotFound` are rejected
/// operations and are returned to the caller untouched. `ResourceInitFailed`
/// and `ExceptionThresholdExceeded` end a crawl run and are recorded on the job.
/// `PersistenceFailed` wraps every store error.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Invalid transition for job {job_id}: cannot {action} while {from}")]
    InvalidTransition {
        job_id: i64,
        from: JobStatus,
        action: &'static str,
    },

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Resource initialization failed: {0}")]
    ResourceInitFailed(String),

    #[error("Exception threshold exceeded after {failures} consecutive failures: {last_error}")]
    ExceptionThresholdExceeded { failures: u32, last_error: String },

    #[error("Persistence failed: {0}")]
    PersistenceFailed(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
}

impl TaskError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::PreconditionFailed(message.into())
    }

    /// Whether the caller should treat this as a rejected request rather than a runtime failure.
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. } | Self::PreconditionFailed(_) | Self::NotFound { .. }
        )
    }
}

impl From<sqlx::Error> for TaskError {
    fn from(err: sqlx::Error) -> Self {
        Self::PersistenceFailed(err.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::PersistenceFailed(format!("payload encoding: {err}"))
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        Self::PersistenceFailed(format!("io: {err}"))
    }
}
