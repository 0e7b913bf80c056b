//! Broadcaster for change events.
//!
//! The `ChangeEventBroadcaster` is the bus storage writers publish to. It uses
//! tokio's broadcast channel so several consumers (the listener dispatcher,
//! ad-hoc subscribers in tests) can observe the same stream.

use std::sync::Arc;
use tokio::sync::broadcast;

use super::types::ChangeEvent;

/// Default buffer size for the broadcast channel.
/// Receivers that fall further behind than this observe a lag.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Broadcaster for change events.
///
/// Cheap to clone; every clone feeds the same channel.
///
/// # Example
///
/// ```
/// use octofhir_core::events::{ChangeEvent, ChangeEventBroadcaster, ResourceId};
///
/// let broadcaster = ChangeEventBroadcaster::new();
/// let mut receiver = broadcaster.subscribe();
///
/// broadcaster.send(ChangeEvent::created(ResourceId::new("Patient", "123")));
/// assert_eq!(receiver.try_recv().unwrap().len(), 1);
/// ```
#[derive(Clone)]
pub struct ChangeEventBroadcaster {
    sender: broadcast::Sender<Arc<ChangeEvent>>,
}

impl ChangeEventBroadcaster {
    /// Create a new broadcaster with default buffer size.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    /// Create a new broadcaster with custom buffer size.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a new broadcaster wrapped in an Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Send a change event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, 0 when
    /// nobody is listening. Empty events are not sent.
    pub fn send(&self, event: ChangeEvent) -> usize {
        if event.is_empty() {
            return 0;
        }
        self.sender.send(Arc::new(event)).unwrap_or_default()
    }

    /// Subscribe to events.
    ///
    /// Events sent before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ChangeEvent>> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Check if there are any active subscribers.
    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }
}

impl Default for ChangeEventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChangeEventBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeEventBroadcaster")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::ResourceId;

    #[tokio::test]
    async fn test_broadcast_to_multiple_subscribers() {
        let broadcaster = ChangeEventBroadcaster::new();
        let mut rx1 = broadcaster.subscribe();
        let mut rx2 = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 2);

        let sent = broadcaster.send(ChangeEvent::updated(ResourceId::new("Patient", "1")));
        assert_eq!(sent, 2);

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert!(Arc::ptr_eq(&e1, &e2));
        assert_eq!(e1.updated_ids().len(), 1);
    }

    #[test]
    fn test_send_without_subscribers() {
        let broadcaster = ChangeEventBroadcaster::new();
        assert!(!broadcaster.has_subscribers());
        assert_eq!(
            broadcaster.send(ChangeEvent::created(ResourceId::new("Patient", "1"))),
            0
        );
    }

    #[test]
    fn test_empty_event_is_not_sent() {
        let broadcaster = ChangeEventBroadcaster::new();
        let mut rx = broadcaster.subscribe();
        let empty = ChangeEvent::builder().build().unwrap();
        assert_eq!(broadcaster.send(empty), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let broadcaster = ChangeEventBroadcaster::with_capacity(2);
        let mut rx = broadcaster.subscribe();
        for i in 0..5 {
            broadcaster.send(ChangeEvent::created(ResourceId::new("Patient", i.to_string())));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
    }
}
