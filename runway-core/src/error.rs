use thiserror::Error;

use runway_model::ModelError;

#[derive(Error, Debug)]
pub enum RunwayError {
    /// Referenced entity is absent (e.g. heartbeat from an evicted agent).
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic check or concurrent modification; always retried.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Offset {offset} is past the end of a {length}-byte log stream")]
    OutOfRange { offset: u64, length: u64 },

    /// Store connectivity; retried with backoff, never fatal to a subsystem.
    #[error("Store unavailable: {0}")]
    TransientInfra(String),

    /// The operation would break a model invariant and was rejected.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RunwayError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RunwayError::Conflict(_) | RunwayError::TransientInfra(_)
        )
    }

    /// Wraps a store error with the operation that produced it while keeping
    /// its classification.
    pub fn store(op: &str, err: sqlx::Error) -> Self {
        match RunwayError::from(err) {
            RunwayError::NotFound(msg) => {
                RunwayError::NotFound(format!("{op}: {msg}"))
            }
            RunwayError::Conflict(msg) => {
                RunwayError::Conflict(format!("{op}: {msg}"))
            }
            RunwayError::TransientInfra(msg) => {
                RunwayError::TransientInfra(format!("{op}: {msg}"))
            }
            RunwayError::Internal(msg) => {
                RunwayError::Internal(format!("{op}: {msg}"))
            }
            other => other,
        }
    }
}

impl From<sqlx::Error> for RunwayError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => {
                RunwayError::NotFound("row not found".to_string())
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => {
                RunwayError::TransientInfra(err.to_string())
            }
            sqlx::Error::Database(ref db_err) => {
                match db_err.code().as_deref() {
                    // serialization_failure, deadlock_detected, unique_violation
                    Some("40001") | Some("40P01") | Some("23505") => {
                        RunwayError::Conflict(db_err.to_string())
                    }
                    // admin_shutdown, crash_shutdown, cannot_connect_now
                    Some("57P01") | Some("57P02") | Some("57P03") => {
                        RunwayError::TransientInfra(db_err.to_string())
                    }
                    _ => RunwayError::Internal(err.to_string()),
                }
            }
            other => RunwayError::Internal(other.to_string()),
        }
    }
}

impl From<ModelError> for RunwayError {
    fn from(err: ModelError) -> Self {
        RunwayError::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RunwayError>;
