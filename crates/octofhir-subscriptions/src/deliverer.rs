//! Publishing built payloads to their destination channels.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use octofhir_core::events::{Isolated, run_isolated};
use tracing::{debug, warn};

use crate::channel::{Ack, Channel, ChannelId};
use crate::error::ChannelError;
use crate::interceptor::{InterceptorBroadcaster, Veto};
use crate::types::NotificationPayload;

/// Default upper bound for one channel publish.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of publishing to one destination.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationResult {
    pub channel_id: ChannelId,
    pub result: Result<Ack, ChannelError>,
}

/// Per-destination results of one delivery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryReport {
    pub results: Vec<DestinationResult>,
}

impl DeliveryReport {
    pub fn delivered(&self) -> usize {
        self.results.iter().filter(|r| r.result.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &DestinationResult> {
        self.results.iter().filter(|r| r.result.is_err())
    }

    pub fn all_delivered(&self) -> bool {
        self.results.iter().all(|r| r.result.is_ok())
    }
}

/// What happened to a payload handed to the deliverer.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// A before-delivery interceptor vetoed; no channel was called.
    Skipped(Veto),
    /// Every destination was attempted.
    Attempted(DeliveryReport),
}

impl DeliveryOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, DeliveryOutcome::Skipped(_))
    }

    pub fn report(&self) -> Option<&DeliveryReport> {
        match self {
            DeliveryOutcome::Skipped(_) => None,
            DeliveryOutcome::Attempted(report) => Some(report),
        }
    }
}

/// Publishes payloads to channels, wrapped in before/after interceptor calls.
///
/// Delivery is at-least-once: nothing here deduplicates. Destinations are
/// published concurrently and independently; one failing, hanging or
/// panicking channel never affects the others.
pub struct MatchDeliverer {
    interceptors: Arc<InterceptorBroadcaster>,
    publish_timeout: Duration,
}

impl MatchDeliverer {
    pub fn new(interceptors: Arc<InterceptorBroadcaster>) -> Self {
        Self::with_timeout(interceptors, DEFAULT_PUBLISH_TIMEOUT)
    }

    pub fn with_timeout(interceptors: Arc<InterceptorBroadcaster>, publish_timeout: Duration) -> Self {
        Self {
            interceptors,
            publish_timeout,
        }
    }

    pub fn interceptors(&self) -> &Arc<InterceptorBroadcaster> {
        &self.interceptors
    }

    /// Deliver `payload` to every destination.
    pub async fn deliver(
        &self,
        payload: &NotificationPayload,
        destinations: &[Arc<dyn Channel>],
    ) -> DeliveryOutcome {
        let ids: Vec<ChannelId> = destinations.iter().map(|c| c.id().to_string()).collect();

        if let Some(veto) = self.interceptors.before_delivery(payload, &ids).await {
            return DeliveryOutcome::Skipped(veto);
        }

        let timeout = self.publish_timeout;
        let attempts = destinations.iter().map(|channel| async move {
            let result = match run_isolated(timeout, channel.publish(payload)).await {
                Isolated::Completed(result) => result,
                Isolated::Panicked(msg) => Err(ChannelError::Panicked(msg)),
                Isolated::TimedOut => Err(ChannelError::Timeout(timeout)),
            };
            DestinationResult {
                channel_id: channel.id().to_string(),
                result,
            }
        });
        let report = DeliveryReport {
            results: join_all(attempts).await,
        };

        for failure in report.failures() {
            if let Err(e) = &failure.result {
                warn!(
                    topic_id = %payload.topic_id,
                    channel = %failure.channel_id,
                    error = %e,
                    "Notification delivery failed"
                );
            }
        }
        debug!(
            topic_id = %payload.topic_id,
            delivered = report.delivered(),
            destinations = report.results.len(),
            "Notification delivered"
        );

        self.interceptors.after_delivery(payload, &report).await;
        DeliveryOutcome::Attempted(report)
    }
}

impl std::fmt::Debug for MatchDeliverer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchDeliverer")
            .field("publish_timeout", &self.publish_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::QueueChannel;
    use crate::interceptor::{DeliveryInterceptor, HookDecision};
    use crate::types::PayloadContent;
    use async_trait::async_trait;
    use octofhir_core::{ChangeKind, ResourceId};
    use parking_lot::Mutex;

    fn payload() -> NotificationPayload {
        NotificationPayload {
            topic_id: "t1".into(),
            topic_url: None,
            interaction: ChangeKind::Created,
            content: PayloadContent::ResourceId(ResourceId::new("Patient", "p1")),
            focus_reference: Some("Patient/p1".into()),
        }
    }

    struct BrokenChannel;

    #[async_trait]
    impl Channel for BrokenChannel {
        fn id(&self) -> &str {
            "broken"
        }

        async fn publish(&self, _payload: &NotificationPayload) -> Result<Ack, ChannelError> {
            Err(ChannelError::unavailable("connection refused"))
        }
    }

    struct HangingChannel;

    #[async_trait]
    impl Channel for HangingChannel {
        fn id(&self) -> &str {
            "hanging"
        }

        async fn publish(&self, _payload: &NotificationPayload) -> Result<Ack, ChannelError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Ack::default())
        }
    }

    struct PanickingChannel;

    #[async_trait]
    impl Channel for PanickingChannel {
        fn id(&self) -> &str {
            "panicking"
        }

        async fn publish(&self, _payload: &NotificationPayload) -> Result<Ack, ChannelError> {
            panic!("transport bug");
        }
    }

    #[derive(Default)]
    struct Recorder {
        vetoing: bool,
        reports: Mutex<Vec<DeliveryReport>>,
    }

    #[async_trait]
    impl DeliveryInterceptor for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn before_delivery(
            &self,
            _payload: &NotificationPayload,
            _destinations: &[ChannelId],
        ) -> HookDecision {
            if self.vetoing {
                HookDecision::veto("paused")
            } else {
                HookDecision::Proceed
            }
        }

        async fn after_delivery(&self, _payload: &NotificationPayload, report: &DeliveryReport) {
            self.reports.lock().push(report.clone());
        }
    }

    #[tokio::test]
    async fn test_one_failing_destination_does_not_block_others() {
        let recorder = Arc::new(Recorder::default());
        let interceptors = Arc::new(InterceptorBroadcaster::new());
        interceptors.register_delivery(recorder.clone());
        let deliverer = MatchDeliverer::with_timeout(interceptors, Duration::from_millis(50));

        let (a, mut rx_a) = QueueChannel::new("a", 4);
        let (b, mut rx_b) = QueueChannel::new("b", 4);
        let destinations: Vec<Arc<dyn Channel>> = vec![
            Arc::new(a),
            Arc::new(BrokenChannel),
            Arc::new(HangingChannel),
            Arc::new(PanickingChannel),
            Arc::new(b),
        ];

        let outcome = deliverer.deliver(&payload(), &destinations).await;
        let report = outcome.report().unwrap();

        assert_eq!(report.results.len(), 5);
        assert_eq!(report.delivered(), 2);
        let failed: Vec<_> = report.failures().map(|f| f.channel_id.as_str()).collect();
        assert_eq!(failed, vec!["broken", "hanging", "panicking"]);
        assert!(matches!(
            report.results[2].result,
            Err(ChannelError::Timeout(_))
        ));
        assert!(matches!(
            report.results[3].result,
            Err(ChannelError::Panicked(_))
        ));

        // Each healthy channel received the payload exactly once
        assert_eq!(rx_a.recv().await.unwrap(), payload());
        assert_eq!(rx_b.recv().await.unwrap(), payload());
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());

        // The after hook saw the same report
        assert_eq!(recorder.reports.lock().as_slice(), &[report.clone()]);
    }

    #[tokio::test]
    async fn test_veto_skips_every_channel() {
        let recorder = Arc::new(Recorder {
            vetoing: true,
            ..Default::default()
        });
        let interceptors = Arc::new(InterceptorBroadcaster::new());
        interceptors.register_delivery(recorder.clone());
        let deliverer = MatchDeliverer::new(interceptors);

        let (channel, mut rx) = QueueChannel::new("a", 4);
        let destinations: Vec<Arc<dyn Channel>> = vec![Arc::new(channel)];

        let outcome = deliverer.deliver(&payload(), &destinations).await;
        assert!(outcome.is_skipped());
        assert!(rx.try_recv().is_err());
        assert!(recorder.reports.lock().is_empty());
    }

    #[tokio::test]
    async fn test_no_destinations() {
        let deliverer = MatchDeliverer::new(Arc::new(InterceptorBroadcaster::new()));
        let outcome = deliverer.deliver(&payload(), &[]).await;
        let report = outcome.report().unwrap();
        assert!(report.results.is_empty());
        assert!(report.all_delivered());
    }
}
