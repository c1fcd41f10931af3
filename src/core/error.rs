use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Container '{0}' not found")]
    ContainerNotFound(String),

    #[error("Container '{0}' already exists")]
    ContainerExists(String),

    #[error("Item '{0}' not found in partition '{1}'")]
    NotFound(String, String),

    #[error("Item '{0}' already exists in partition '{1}'")]
    Conflict(String, String),

    #[error("Precondition failed for item '{0}': etag mismatch")]
    PreconditionFailed(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Whether a bounded retry is worth attempting.
    ///
    /// Requests that failed deterministically (NotFound, InvalidArgument, a
    /// lost etag race) are excluded so they surface to the caller on the
    /// first attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::LockError(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Transient("throttled".into()).is_transient());
        assert!(StoreError::LockError("poisoned".into()).is_transient());

        assert!(!StoreError::NotFound("id".into(), "pk".into()).is_transient());
        assert!(!StoreError::InvalidArgument("bad".into()).is_transient());
        assert!(!StoreError::PreconditionFailed("lease".into()).is_transient());
        assert!(!StoreError::Cancelled.is_transient());
    }
}
