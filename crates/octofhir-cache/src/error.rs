//! Errors raised while resolving the cache keys a change affects.

use std::time::Duration;

use octofhir_storage::StorageError;

/// Why the derived keys of a changed resource could not be determined.
///
/// Every variant leads the invalidation listener to clear the whole cache.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("storage read failed: {0}")]
    Storage(#[from] StorageError),

    #[error("storage read timed out after {0:?}")]
    Timeout(Duration),

    #[error("no prior version of {0} is available")]
    MissingPrior(String),

    #[error("version history of {0} is not available")]
    MissingHistory(String),

    #[error("{0} was re-created after its delete")]
    Recreated(String),

    #[error("expected a {expected} resource, found {found}")]
    UnexpectedType { expected: String, found: String },

    #[error("invalid resource: {0}")]
    InvalidResource(String),
}

impl ResolveError {
    pub fn unexpected_type(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::UnexpectedType {
            expected: expected.into(),
            found: found.into(),
        }
    }

    pub fn invalid_resource(message: impl Into<String>) -> Self {
        Self::InvalidResource(message.into())
    }

    /// True when the resource no longer exists in storage.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_not_found())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_predicate() {
        let err: ResolveError = StorageError::not_found("Library", "lib-1").into();
        assert!(err.is_not_found());
        assert!(!ResolveError::MissingPrior("Library/lib-1".into()).is_not_found());
    }

    #[test]
    fn test_display() {
        let err = ResolveError::unexpected_type("Library", "Patient");
        assert_eq!(err.to_string(), "expected a Library resource, found Patient");
    }
}
