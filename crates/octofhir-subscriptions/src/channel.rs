//! Delivery channels and the topic-to-channel registry.
//!
//! A [`Channel`] is an opaque publish target. Transport, retries and
//! idempotence belong to the channel; the deliverer only reports what
//! `publish` returned.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::ChannelError;
use crate::types::NotificationPayload;

/// Identity of a channel, unique within a [`ChannelRegistry`] topic entry.
pub type ChannelId = String;

/// Acknowledgement returned by a successful publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ack {
    /// Channel-specific receipt, e.g. a message id.
    pub receipt: Option<String>,
}

impl Ack {
    pub fn with_receipt(receipt: impl Into<String>) -> Self {
        Self {
            receipt: Some(receipt.into()),
        }
    }
}

/// Trait for notification delivery channels.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel identity for logging and outcome reports.
    fn id(&self) -> &str;

    /// Publish a payload. Returns once the channel accepted or terminally
    /// rejected it.
    async fn publish(&self, payload: &NotificationPayload) -> Result<Ack, ChannelError>;
}

/// Channels registered per topic id.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Vec<Arc<dyn Channel>>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel for a topic. A channel with the same id replaces
    /// the previous registration.
    pub fn register(&self, topic_id: &str, channel: Arc<dyn Channel>) {
        let mut channels = self.channels.write();
        let entry = channels.entry(topic_id.to_string()).or_default();
        entry.retain(|c| c.id() != channel.id());

        tracing::debug!(topic_id = topic_id, channel = channel.id(), "Channel registered");
        entry.push(channel);
    }

    /// Remove a channel from a topic. Returns true if one was removed.
    pub fn unregister(&self, topic_id: &str, channel_id: &str) -> bool {
        let mut channels = self.channels.write();
        let Some(entry) = channels.get_mut(topic_id) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|c| c.id() != channel_id);
        let removed = entry.len() != before;
        if entry.is_empty() {
            channels.remove(topic_id);
        }

        if removed {
            tracing::debug!(topic_id = topic_id, channel = channel_id, "Channel unregistered");
        }
        removed
    }

    /// Channels registered for a topic, in registration order.
    pub fn channels_for(&self, topic_id: &str) -> Vec<Arc<dyn Channel>> {
        self.channels
            .read()
            .get(topic_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of topics with at least one channel.
    pub fn topic_count(&self) -> usize {
        self.channels.read().len()
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("topics", &self.topic_count())
            .finish()
    }
}

// ============================================================================
// In-process queue channel
// ============================================================================

/// Channel that hands payloads to an in-process consumer over a bounded queue.
///
/// Publishing waits for queue capacity; a dropped receiver makes every
/// further publish fail with [`ChannelError::Closed`].
pub struct QueueChannel {
    id: ChannelId,
    sender: mpsc::Sender<NotificationPayload>,
}

impl QueueChannel {
    /// Create a channel and the receiver its consumer reads from.
    pub fn new(
        id: impl Into<ChannelId>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<NotificationPayload>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: id.into(),
                sender,
            },
            receiver,
        )
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[async_trait]
impl Channel for QueueChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn publish(&self, payload: &NotificationPayload) -> Result<Ack, ChannelError> {
        self.sender
            .send(payload.clone())
            .await
            .map_err(|_| ChannelError::Closed(format!("consumer of {} went away", self.id)))?;
        Ok(Ack::default())
    }
}

impl std::fmt::Debug for QueueChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueChannel")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
