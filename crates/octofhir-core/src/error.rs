use thiserror::Error;

/// Core error types shared across the change notification crates
#[derive(Debug, Error)]
pub enum CoreError {
    /// A programming contract was broken upstream, e.g. a change event that
    /// lists one id under two change kinds.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Invalid resource data: {message}")]
    InvalidResource { message: String },

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl CoreError {
    /// Create a new InvariantViolation error
    pub fn invariant_violation(message: impl Into<String>) -> Self {
        Self::InvariantViolation(message.into())
    }

    /// Create a new InvalidResource error
    pub fn invalid_resource(message: impl Into<String>) -> Self {
        Self::InvalidResource {
            message: message.into(),
        }
    }

    /// Create a new Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Whether the error is caused by bad input rather than a broken contract
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidResource { .. } | Self::JsonError(_))
    }
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
