//! Error types for topic loading, matching and delivery.
//!
//! None of these are fatal: load failures keep the previous topic snapshot,
//! evaluation failures make a single trigger non-matching, channel failures
//! are reported per destination.

use std::time::Duration;

use octofhir_storage::StorageError;

/// A topic reload did not publish a new snapshot.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("topic storage unavailable: {0}")]
    Storage(#[from] StorageError),

    #[error("topic storage query timed out after {0:?}")]
    Timeout(Duration),

    #[error("reload vetoed by interceptor '{interceptor}': {reason}")]
    Vetoed { interceptor: String, reason: String },
}

impl LoadError {
    /// Whether the reload service should try again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LoadError::Vetoed { .. })
    }
}

/// A stored SubscriptionTopic could not be turned into a topic definition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicParseError {
    #[error("missing {0}")]
    MissingField(&'static str),

    #[error("invalid {field} '{value}'")]
    InvalidCode { field: &'static str, value: String },

    #[error("topic declares no resource triggers")]
    NoTriggers,

    #[error("resourceTrigger[{index}]: {reason}")]
    InvalidTrigger { index: usize, reason: String },
}

impl TopicParseError {
    pub(crate) fn invalid_code(field: &'static str, value: impl Into<String>) -> Self {
        TopicParseError::InvalidCode {
            field,
            value: value.into(),
        }
    }

    pub(crate) fn invalid_trigger(index: usize, reason: impl std::fmt::Display) -> Self {
        TopicParseError::InvalidTrigger {
            index,
            reason: reason.to_string(),
        }
    }
}

/// A criteria expression could not be evaluated.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EvaluationError {
    #[error("failed to evaluate '{expression}': {message}")]
    Expression { expression: String, message: String },

    #[error("evaluation of '{expression}' timed out after {timeout:?}")]
    Timeout { expression: String, timeout: Duration },

    #[error("unsupported criteria: {0}")]
    Unsupported(String),
}

impl EvaluationError {
    pub fn expression(expression: impl Into<String>, message: impl Into<String>) -> Self {
        EvaluationError::Expression {
            expression: expression.into(),
            message: message.into(),
        }
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        EvaluationError::Unsupported(what.into())
    }
}

/// A channel failed to accept a payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel unavailable: {0}")]
    Unavailable(String),

    #[error("channel closed: {0}")]
    Closed(String),

    #[error("payload rejected: {0}")]
    Rejected(String),

    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("channel panicked: {0}")]
    Panicked(String),
}

impl ChannelError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        ChannelError::Unavailable(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        ChannelError::Rejected(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_retryable() {
        assert!(LoadError::Storage(StorageError::connection_error("down")).is_retryable());
        assert!(LoadError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(
            !LoadError::Vetoed {
                interceptor: "maintenance".into(),
                reason: "frozen".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            TopicParseError::invalid_code("status", "bogus").to_string(),
            "invalid status 'bogus'"
        );
        assert_eq!(
            TopicParseError::invalid_trigger(2, "missing resource").to_string(),
            "resourceTrigger[2]: missing resource"
        );
        assert_eq!(
            EvaluationError::expression("active = true", "bad token").to_string(),
            "failed to evaluate 'active = true': bad token"
        );
        assert_eq!(
            ChannelError::unavailable("queue full").to_string(),
            "channel unavailable: queue full"
        );
    }
}
