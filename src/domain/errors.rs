//! Domain errors for the sluice job controller.

use thiserror::Error;

/// Domain-level errors that can occur while reconciling jobs.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Feature set not found: {0}")]
    FeatureSetNotFound(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Concurrency conflict: {entity} {id} was modified")]
    ConcurrencyConflict { entity: String, id: String },

    #[error("Operation timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Job manager error: {0}")]
    JobManager(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Notification channel error: {0}")]
    Channel(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Cannot derive job identity: {0}")]
    Identity(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl DomainError {
    /// Whether retrying on a later tick may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict { .. }
                | Self::Timeout { .. }
                | Self::JobManager(_)
                | Self::Catalog(_)
                | Self::Channel(_)
                | Self::DatabaseError(_)
        )
    }
}

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for DomainError {
    fn from(err: reqwest::Error) -> Self {
        DomainError::Catalog(err.to_string())
    }
}
