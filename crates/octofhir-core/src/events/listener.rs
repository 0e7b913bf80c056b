//! Listener trait for resource change events.
//!
//! Listeners are asynchronous handlers that react to [`ChangeEvent`]s.
//! They are designed to be:
//! - **Async**: run in their own tokio task, off the producer's path
//! - **Isolated**: an error or panic in one listener never reaches another
//! - **Filtered**: each listener sees only the resource types it declared

use async_trait::async_trait;

use super::types::ChangeEvent;

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Listener execution failed with a message.
    #[error("Listener execution failed: {0}")]
    Execution(String),

    /// Listener failed to hand work to an internal channel.
    #[error("Channel send failed: {0}")]
    Channel(String),

    /// Listener failed while reading from storage.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Generic error with source.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ListenerError {
    /// Create an execution error from a string.
    pub fn execution(msg: impl Into<String>) -> Self {
        ListenerError::Execution(msg.into())
    }

    /// Create a channel error from a string.
    pub fn channel(msg: impl Into<String>) -> Self {
        ListenerError::Channel(msg.into())
    }

    /// Create a storage error from a string.
    pub fn storage(msg: impl Into<String>) -> Self {
        ListenerError::Storage(msg.into())
    }
}

/// Handler for resource change events.
///
/// # Implementation Notes
///
/// - `handle_change` should return quickly; hand heavy work to an internal channel
/// - Errors are logged by the registry and never reach the producer
/// - Listeners run in isolated tokio tasks with timeout and panic protection
///
/// # Example
///
/// ```ignore
/// struct TopicReloadTrigger {
///     notifier: Arc<TopicChangeNotifier>,
/// }
///
/// #[async_trait]
/// impl ResourceChangeListener for TopicReloadTrigger {
///     fn name(&self) -> &str { "topic_reload" }
///     fn resource_types(&self) -> &[&str] { &["SubscriptionTopic"] }
///
///     async fn handle_change(&self, _event: &ChangeEvent) -> Result<(), ListenerError> {
///         self.notifier.notify();
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ResourceChangeListener: Send + Sync {
    /// Unique name for this listener (for logging).
    fn name(&self) -> &str;

    /// Resource types this listener is interested in.
    ///
    /// Return an empty slice to receive every resource type.
    fn resource_types(&self) -> &[&str] {
        &[]
    }

    /// Handle a change event, already restricted to [`Self::resource_types`].
    async fn handle_change(&self, event: &ChangeEvent) -> Result<(), ListenerError>;

    /// Called when the event source dropped `missed` events before they
    /// reached this listener.
    async fn on_events_missed(&self, _missed: u64) -> Result<(), ListenerError> {
        Ok(())
    }

    /// Called when the listener system starts.
    async fn on_start(&self) -> Result<(), ListenerError> {
        Ok(())
    }

    /// Called when the listener system shuts down.
    async fn on_shutdown(&self) -> Result<(), ListenerError> {
        Ok(())
    }

    /// Restrict an event to this listener's resource types.
    ///
    /// Returns `None` when nothing in the event concerns the listener.
    fn select(&self, event: &ChangeEvent) -> Option<ChangeEvent> {
        let selected = event.restricted_to(self.resource_types());
        (!selected.is_empty()).then_some(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::ResourceId;

    struct TypedListener {
        resource_types: Vec<&'static str>,
    }

    #[async_trait]
    impl ResourceChangeListener for TypedListener {
        fn name(&self) -> &str {
            "typed"
        }

        fn resource_types(&self) -> &[&str] {
            &self.resource_types
        }

        async fn handle_change(&self, _event: &ChangeEvent) -> Result<(), ListenerError> {
            Ok(())
        }
    }

    #[test]
    fn test_select_by_type() {
        let listener = TypedListener {
            resource_types: vec!["Library"],
        };

        let event = ChangeEvent::builder()
            .created(ResourceId::new("Patient", "1"))
            .updated(ResourceId::new("Library", "2"))
            .build()
            .unwrap();

        let selected = listener.select(&event).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected.updated_ids()[0].resource_type, "Library");

        let only_patients = ChangeEvent::created(ResourceId::new("Patient", "9"));
        assert!(listener.select(&only_patients).is_none());
    }

    #[test]
    fn test_select_all() {
        let listener = TypedListener {
            resource_types: vec![],
        };
        let event = ChangeEvent::deleted(ResourceId::new("Encounter", "3"));
        assert_eq!(listener.select(&event).unwrap().len(), 1);
    }

    #[test]
    fn test_listener_error_display() {
        let err = ListenerError::execution("something went wrong");
        assert_eq!(
            err.to_string(),
            "Listener execution failed: something went wrong"
        );

        let err = ListenerError::storage("connection failed");
        assert_eq!(err.to_string(), "Storage error: connection failed");
    }
}
