//! Change listener running the topic pipeline: match, build, deliver.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use octofhir_core::ChangeEvent;
use octofhir_core::events::{ListenerError, ResourceChangeListener};
use tracing::{debug, warn};

use crate::channel::ChannelRegistry;
use crate::deliverer::{DeliveryOutcome, MatchDeliverer};
use crate::payload::PayloadBuilder;
use crate::subscriber::MatchingSubscriber;

/// Resource types whose changes never produce topic notifications.
///
/// Notifications about subscription machinery, or audit records written
/// while delivering, would feed back into the pipeline.
pub const IGNORED_RESOURCE_TYPES: &[&str] = &[
    "Subscription",
    "SubscriptionTopic",
    "SubscriptionStatus",
    "AuditEvent",
];

/// Counters of the matching listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchingStats {
    pub events_processed: u64,
    pub matches: u64,
    pub payloads_skipped: u64,
    pub deliveries_vetoed: u64,
    pub destinations_failed: u64,
    pub events_missed: u64,
}

/// Listener that matches each change event against the published topics and
/// delivers a payload to every channel of every matching topic.
pub struct TopicMatchingListener {
    subscriber: MatchingSubscriber,
    builder: PayloadBuilder,
    deliverer: MatchDeliverer,
    channels: Arc<ChannelRegistry>,

    events_processed: AtomicU64,
    matches: AtomicU64,
    payloads_skipped: AtomicU64,
    deliveries_vetoed: AtomicU64,
    destinations_failed: AtomicU64,
    events_missed: AtomicU64,
}

impl TopicMatchingListener {
    pub fn new(
        subscriber: MatchingSubscriber,
        deliverer: MatchDeliverer,
        channels: Arc<ChannelRegistry>,
    ) -> Self {
        Self {
            subscriber,
            builder: PayloadBuilder::new(),
            deliverer,
            channels,
            events_processed: AtomicU64::new(0),
            matches: AtomicU64::new(0),
            payloads_skipped: AtomicU64::new(0),
            deliveries_vetoed: AtomicU64::new(0),
            destinations_failed: AtomicU64::new(0),
            events_missed: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> MatchingStats {
        MatchingStats {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            matches: self.matches.load(Ordering::Relaxed),
            payloads_skipped: self.payloads_skipped.load(Ordering::Relaxed),
            deliveries_vetoed: self.deliveries_vetoed.load(Ordering::Relaxed),
            destinations_failed: self.destinations_failed.load(Ordering::Relaxed),
            events_missed: self.events_missed.load(Ordering::Relaxed),
        }
    }

    /// Run the pipeline for one event.
    pub async fn process(&self, event: &ChangeEvent) {
        let event = event.without_types(IGNORED_RESOURCE_TYPES);
        if event.is_empty() {
            return;
        }
        self.events_processed.fetch_add(1, Ordering::Relaxed);

        let matched = self.subscriber.match_event(&event).await;
        self.matches.fetch_add(matched.len() as u64, Ordering::Relaxed);

        for change in matched {
            let Some(payload) = self.builder.build(&change.result, change.body) else {
                self.payloads_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            let destinations = self.channels.channels_for(&change.result.topic_id);
            if destinations.is_empty() {
                debug!(topic_id = %change.result.topic_id, "No channels registered for matched topic");
                continue;
            }

            match self.deliverer.deliver(&payload, &destinations).await {
                DeliveryOutcome::Skipped(_) => {
                    self.deliveries_vetoed.fetch_add(1, Ordering::Relaxed);
                }
                DeliveryOutcome::Attempted(report) => {
                    let failed = report.failures().count() as u64;
                    self.destinations_failed.fetch_add(failed, Ordering::Relaxed);
                }
            }
        }
    }
}

#[async_trait]
impl ResourceChangeListener for TopicMatchingListener {
    fn name(&self) -> &str {
        "topic_matching"
    }

    async fn handle_change(&self, event: &ChangeEvent) -> Result<(), ListenerError> {
        self.process(event).await;
        Ok(())
    }

    async fn on_events_missed(&self, missed: u64) -> Result<(), ListenerError> {
        // Changes are not replayed; their notifications are lost
        self.events_missed.fetch_add(missed, Ordering::Relaxed);
        warn!(missed, "Change events missed, their topic notifications were not sent");
        Ok(())
    }
}

impl std::fmt::Debug for TopicMatchingListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicMatchingListener")
            .field("subscriber", &self.subscriber)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
