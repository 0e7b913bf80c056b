//! # octofhir-runtime
//!
//! Starts the change notification pipeline over a storage backend:
//!
//! ```text
//! EventedStorage -> ChangeEventBroadcaster -> ListenerDispatcher -> ListenerRegistry
//!                                                                    |- topic_matching
//!                                                                    |- topic_reload_trigger -> TopicReloadService
//!                                                                    '- library_cache_invalidation
//! ```
//!
//! ```ignore
//! let config = octofhir_config::load_config(None)?;
//! octofhir_runtime::observability::init_tracing_with_level(&config.logging.level);
//! let runtime = ChangeNotificationRuntime::start(config, InMemoryStorage::new(), matcher).await;
//! runtime.channels().register("admissions", Arc::new(channel));
//! ```

pub mod bootstrap;
pub mod observability;

pub use bootstrap::{ChangeNotificationRuntime, pipeline_options};
