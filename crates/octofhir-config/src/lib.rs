//! Configuration for the OctoFHIR change notification runtime.
//!
//! Settings come from an optional TOML file overlaid with `OCTOFHIR__`
//! environment variables, e.g. `OCTOFHIR__SUBSCRIPTIONS__RELOAD_DEBOUNCE_MS=250`.
//! Every field has a default, so an empty file is a valid configuration.

pub mod loader;
pub mod settings;

pub use loader::{DEFAULT_CONFIG_PATH, load_config};
pub use settings::{AppConfig, CacheSettings, EventSettings, LoggingConfig, SubscriptionSettings};

/// Error types for configuration operations
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config build error: {0}")]
    Build(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl ConfigError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
