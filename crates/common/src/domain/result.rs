use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unsupported unit '{unit}' for metric {metric}")]
    UnsupportedUnit { metric: String, unit: String },

    #[error("Publish error: {0}")]
    PublishError(String),

    #[error("Delivery failed after {attempts} attempts: {reason}")]
    DeliveryFailure { attempts: u32, reason: String },

    #[error("Conflict on {aggregate}: expected sequence {expected:?}, found {actual:?}")]
    ConflictError {
        aggregate: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("Event already applied: {0}")]
    AlreadyApplied(String),

    #[error("Storage error: {0}")]
    StorageError(#[from] anyhow::Error),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Processing error: {0}")]
    ProcessingError(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl DomainError {
    /// Transient errors are worth retrying close to their origin or via redelivery.
    /// Permanent errors (bad input, unit catalog gaps) never are.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DomainError::PublishError(_)
                | DomainError::ConflictError { .. }
                | DomainError::StorageError(_)
                | DomainError::CacheError(_)
                | DomainError::Timeout(_)
        )
    }
}
