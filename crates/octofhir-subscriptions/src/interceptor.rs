//! Interceptors around delivery and topic reload.
//!
//! Extensions register [`DeliveryInterceptor`]s and [`ReloadInterceptor`]s on
//! the [`InterceptorBroadcaster`]. "Before" hooks may veto; "after" hooks are
//! informational. Every call runs under a timeout with panics caught, and an
//! interceptor that fails, panics or times out counts as "proceed".

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use octofhir_core::events::{Isolated, run_isolated};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::channel::ChannelId;
use crate::deliverer::DeliveryReport;
use crate::error::LoadError;
use crate::loader::ReloadReport;
use crate::types::NotificationPayload;

/// Default timeout for a single interceptor call.
pub const DEFAULT_INTERCEPTOR_TIMEOUT: Duration = Duration::from_secs(5);

/// Decision returned by a "before" hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    Proceed,
    Veto { reason: String },
}

impl HookDecision {
    pub fn veto(reason: impl Into<String>) -> Self {
        HookDecision::Veto {
            reason: reason.into(),
        }
    }
}

/// A veto together with the interceptor that cast it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Veto {
    pub interceptor: String,
    pub reason: String,
}

/// Hooks around [`MatchDeliverer::deliver`](crate::MatchDeliverer::deliver).
#[async_trait]
pub trait DeliveryInterceptor: Send + Sync {
    fn name(&self) -> &str;

    /// Called before any channel sees the payload.
    async fn before_delivery(
        &self,
        _payload: &NotificationPayload,
        _destinations: &[ChannelId],
    ) -> HookDecision {
        HookDecision::Proceed
    }

    /// Called once all destinations were attempted.
    async fn after_delivery(&self, _payload: &NotificationPayload, _report: &DeliveryReport) {}
}

/// Hooks around [`TopicLoader::reload`](crate::TopicLoader::reload).
#[async_trait]
pub trait ReloadInterceptor: Send + Sync {
    fn name(&self) -> &str;

    /// Called before topic storage is queried.
    async fn before_reload(&self) -> HookDecision {
        HookDecision::Proceed
    }

    /// Called with the reload outcome, successful or not.
    async fn after_reload(&self, _outcome: Result<&ReloadReport, &LoadError>) {}
}

/// Registry and broadcaster for delivery and reload interceptors.
pub struct InterceptorBroadcaster {
    delivery: RwLock<Vec<Arc<dyn DeliveryInterceptor>>>,
    reload: RwLock<Vec<Arc<dyn ReloadInterceptor>>>,
    timeout: Duration,
}

impl InterceptorBroadcaster {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_INTERCEPTOR_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            delivery: RwLock::new(Vec::new()),
            reload: RwLock::new(Vec::new()),
            timeout,
        }
    }

    pub fn register_delivery(&self, interceptor: Arc<dyn DeliveryInterceptor>) {
        debug!(interceptor = %interceptor.name(), "Registered delivery interceptor");
        self.delivery.write().push(interceptor);
    }

    pub fn register_reload(&self, interceptor: Arc<dyn ReloadInterceptor>) {
        debug!(interceptor = %interceptor.name(), "Registered reload interceptor");
        self.reload.write().push(interceptor);
    }

    pub fn delivery_count(&self) -> usize {
        self.delivery.read().len()
    }

    pub fn reload_count(&self) -> usize {
        self.reload.read().len()
    }

    /// Run every before-delivery hook in registration order.
    ///
    /// Stops at the first veto.
    pub async fn before_delivery(
        &self,
        payload: &NotificationPayload,
        destinations: &[ChannelId],
    ) -> Option<Veto> {
        let interceptors = self.delivery.read().clone();
        for interceptor in interceptors {
            let decision = run_before(
                interceptor.name(),
                self.timeout,
                interceptor.before_delivery(payload, destinations),
            )
            .await;
            if let Some(veto) = decision {
                info!(
                    interceptor = %veto.interceptor,
                    reason = %veto.reason,
                    topic_id = %payload.topic_id,
                    "Delivery vetoed"
                );
                return Some(veto);
            }
        }
        None
    }

    /// Run every after-delivery hook.
    pub async fn after_delivery(&self, payload: &NotificationPayload, report: &DeliveryReport) {
        let interceptors = self.delivery.read().clone();
        for interceptor in interceptors {
            run_after(
                interceptor.name(),
                self.timeout,
                interceptor.after_delivery(payload, report),
            )
            .await;
        }
    }

    /// Run every before-reload hook. Stops at the first veto.
    pub async fn before_reload(&self) -> Option<Veto> {
        let interceptors = self.reload.read().clone();
        for interceptor in interceptors {
            let decision =
                run_before(interceptor.name(), self.timeout, interceptor.before_reload()).await;
            if let Some(veto) = decision {
                info!(interceptor = %veto.interceptor, reason = %veto.reason, "Topic reload vetoed");
                return Some(veto);
            }
        }
        None
    }

    /// Run every after-reload hook.
    pub async fn after_reload(&self, outcome: Result<&ReloadReport, &LoadError>) {
        let interceptors = self.reload.read().clone();
        for interceptor in interceptors {
            run_after(interceptor.name(), self.timeout, interceptor.after_reload(outcome)).await;
        }
    }
}

async fn run_before<F>(name: &str, timeout: Duration, fut: F) -> Option<Veto>
where
    F: std::future::Future<Output = HookDecision>,
{
    match run_isolated(timeout, fut).await {
        Isolated::Completed(HookDecision::Proceed) => None,
        Isolated::Completed(HookDecision::Veto { reason }) => Some(Veto {
            interceptor: name.to_string(),
            reason,
        }),
        Isolated::Panicked(msg) => {
            error!(interceptor = %name, panic = %msg, "Interceptor panicked, proceeding");
            None
        }
        Isolated::TimedOut => {
            warn!(interceptor = %name, timeout_ms = timeout.as_millis() as u64, "Interceptor timed out, proceeding");
            None
        }
    }
}

async fn run_after<F>(name: &str, timeout: Duration, fut: F)
where
    F: std::future::Future<Output = ()>,
{
    match run_isolated(timeout, fut).await {
        Isolated::Completed(()) => {}
        Isolated::Panicked(msg) => {
            error!(interceptor = %name, panic = %msg, "Interceptor panicked");
        }
        Isolated::TimedOut => {
            warn!(interceptor = %name, timeout_ms = timeout.as_millis() as u64, "Interceptor timed out");
        }
    }
}

impl Default for InterceptorBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InterceptorBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorBroadcaster")
            .field("delivery", &self.delivery_count())
            .field("reload", &self.reload_count())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use octofhir_core::ChangeKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::types::PayloadContent;

    fn payload() -> NotificationPayload {
        NotificationPayload {
            topic_id: "t1".into(),
            topic_url: None,
            interaction: ChangeKind::Created,
            content: PayloadContent::Empty,
            focus_reference: None,
        }
    }

    struct Gate {
        name: &'static str,
        veto: bool,
        calls: AtomicU32,
    }

    impl Gate {
        fn new(name: &'static str, veto: bool) -> Self {
            Self {
                name,
                veto,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl DeliveryInterceptor for Gate {
        fn name(&self) -> &str {
            self.name
        }

        async fn before_delivery(
            &self,
            _payload: &NotificationPayload,
            _destinations: &[ChannelId],
        ) -> HookDecision {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.veto {
                HookDecision::veto("maintenance window")
            } else {
                HookDecision::Proceed
            }
        }
    }

    #[async_trait]
    impl ReloadInterceptor for Gate {
        fn name(&self) -> &str {
            self.name
        }

        async fn before_reload(&self) -> HookDecision {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.veto {
                HookDecision::veto("frozen")
            } else {
                HookDecision::Proceed
            }
        }
    }

    struct Panicky;

    #[async_trait]
    impl DeliveryInterceptor for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn before_delivery(
            &self,
            _payload: &NotificationPayload,
            _destinations: &[ChannelId],
        ) -> HookDecision {
            panic!("interceptor bug");
        }
    }

    #[tokio::test]
    async fn test_first_veto_wins() {
        let broadcaster = InterceptorBroadcaster::new();
        let first = Arc::new(Gate::new("first", true));
        let second = Arc::new(Gate::new("second", true));
        broadcaster.register_delivery(first.clone());
        broadcaster.register_delivery(second.clone());

        let veto = broadcaster.before_delivery(&payload(), &[]).await.unwrap();
        assert_eq!(veto.interceptor, "first");
        assert_eq!(veto.reason, "maintenance window");
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_proceed_without_interceptors() {
        let broadcaster = InterceptorBroadcaster::new();
        assert!(broadcaster.before_delivery(&payload(), &[]).await.is_none());
        assert!(broadcaster.before_reload().await.is_none());
    }

    #[tokio::test]
    async fn test_panicking_interceptor_does_not_veto() {
        let broadcaster = InterceptorBroadcaster::new();
        let after = Arc::new(Gate::new("after", false));
        broadcaster.register_delivery(Arc::new(Panicky));
        broadcaster.register_delivery(after.clone());

        assert!(broadcaster.before_delivery(&payload(), &[]).await.is_none());
        assert_eq!(after.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reload_veto() {
        let broadcaster = InterceptorBroadcaster::new();
        broadcaster.register_reload(Arc::new(Gate::new("freeze", true)));
        assert_eq!(broadcaster.reload_count(), 1);

        let veto = broadcaster.before_reload().await.unwrap();
        assert_eq!(veto.interceptor, "freeze");
    }
}
