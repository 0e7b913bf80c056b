use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Topic loading, matching and delivery
    #[serde(default)]
    pub subscriptions: SubscriptionSettings,
    /// Derived cache invalidation
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub events: EventSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.subscriptions;
        if s.reload_debounce_ms == 0 || s.reload_backoff_ms == 0 {
            return Err(ConfigError::validation(
                "subscriptions reload debounce and backoff must be > 0",
            ));
        }
        let timeouts = [
            ("subscriptions.storage_timeout_ms", s.storage_timeout_ms),
            ("subscriptions.matcher_timeout_ms", s.matcher_timeout_ms),
            ("subscriptions.publish_timeout_ms", s.publish_timeout_ms),
            ("subscriptions.interceptor_timeout_ms", s.interceptor_timeout_ms),
            ("cache.resolve_timeout_ms", self.cache.resolve_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::validation(format!("{name} must be > 0")));
        }
        if self.events.buffer_size == 0 {
            return Err(ConfigError::validation("events.buffer_size must be > 0"));
        }
        if self.events.listener_timeout_secs == 0 {
            return Err(ConfigError::validation("events.listener_timeout_secs must be > 0"));
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(ConfigError::validation(format!(
                "logging.level must be one of {valid_levels:?}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Periodic topic refresh, 0 disables it
    #[serde(default = "default_reload_interval_secs")]
    pub reload_interval_secs: u64,
    #[serde(default = "default_reload_debounce_ms")]
    pub reload_debounce_ms: u64,
    #[serde(default = "default_reload_max_retries")]
    pub reload_max_retries: u32,
    #[serde(default = "default_reload_backoff_ms")]
    pub reload_backoff_ms: u64,
    #[serde(default = "default_storage_timeout_ms")]
    pub storage_timeout_ms: u64,
    #[serde(default = "default_matcher_timeout_ms")]
    pub matcher_timeout_ms: u64,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    #[serde(default = "default_interceptor_timeout_ms")]
    pub interceptor_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_reload_interval_secs() -> u64 {
    300
}
fn default_reload_debounce_ms() -> u64 {
    100
}
fn default_reload_max_retries() -> u32 {
    3
}
fn default_reload_backoff_ms() -> u64 {
    1000
}
fn default_storage_timeout_ms() -> u64 {
    5000
}
fn default_matcher_timeout_ms() -> u64 {
    1000
}
fn default_publish_timeout_ms() -> u64 {
    10_000
}
fn default_interceptor_timeout_ms() -> u64 {
    5000
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            reload_interval_secs: default_reload_interval_secs(),
            reload_debounce_ms: default_reload_debounce_ms(),
            reload_max_retries: default_reload_max_retries(),
            reload_backoff_ms: default_reload_backoff_ms(),
            storage_timeout_ms: default_storage_timeout_ms(),
            matcher_timeout_ms: default_matcher_timeout_ms(),
            publish_timeout_ms: default_publish_timeout_ms(),
            interceptor_timeout_ms: default_interceptor_timeout_ms(),
        }
    }
}

impl SubscriptionSettings {
    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    pub fn matcher_timeout(&self) -> Duration {
        Duration::from_millis(self.matcher_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn interceptor_timeout(&self) -> Duration {
        Duration::from_millis(self.interceptor_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Register the compiled library cache invalidation listener
    #[serde(default = "default_true")]
    pub library_invalidation: bool,
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,
}

fn default_resolve_timeout_ms() -> u64 {
    5000
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            library_invalidation: true,
            resolve_timeout_ms: default_resolve_timeout_ms(),
        }
    }
}

impl CacheSettings {
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSettings {
    /// Capacity of the change event broadcast channel
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_listener_timeout_secs")]
    pub listener_timeout_secs: u64,
}

fn default_buffer_size() -> usize {
    1024
}
fn default_listener_timeout_secs() -> u64 {
    30
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            listener_timeout_secs: default_listener_timeout_secs(),
        }
    }
}

impl EventSettings {
    pub fn listener_timeout(&self) -> Duration {
        Duration::from_secs(self.listener_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        cfg.validate().unwrap();
        assert!(cfg.subscriptions.enabled);
        assert_eq!(cfg.subscriptions.reload_interval_secs, 300);
        assert_eq!(cfg.subscriptions.publish_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.events.buffer_size, 1024);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.subscriptions.matcher_timeout_ms = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("subscriptions.matcher_timeout_ms"));
    }

    #[test]
    fn test_unknown_log_level_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.logging.level = "verbose".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        cfg.logging.level = "WARN".into();
        cfg.validate().unwrap();
    }

    #[test]
    fn test_periodic_refresh_may_be_disabled() {
        let mut cfg = AppConfig::default();
        cfg.subscriptions.reload_interval_secs = 0;
        cfg.validate().unwrap();
    }
}
