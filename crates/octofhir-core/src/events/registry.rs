//! Listener registry and dispatcher for resource change events.
//!
//! The registry manages listener registration and the dispatcher bridges the
//! broadcast channel to the registry, routing every event to every interested
//! listener with proper isolation and error handling.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::join_all;
use tokio::sync::{RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::listener::{ListenerError, ResourceChangeListener};
use super::types::ChangeEvent;

/// Default timeout for listener execution.
pub const DEFAULT_LISTENER_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Isolation
// ============================================================================

/// Result of running a future under timeout and panic protection.
#[derive(Debug)]
pub enum Isolated<T> {
    /// The future completed.
    Completed(T),
    /// The future panicked; the payload is rendered as text.
    Panicked(String),
    /// The future did not complete within the timeout.
    TimedOut,
}

/// Run `fut` with a timeout, catching panics.
pub async fn run_isolated<T, F>(timeout: Duration, fut: F) -> Isolated<T>
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(timeout, AssertUnwindSafe(fut).catch_unwind()).await {
        Ok(Ok(value)) => Isolated::Completed(value),
        Ok(Err(panic)) => Isolated::Panicked(panic_message(&panic)),
        Err(_) => Isolated::TimedOut,
    }
}

/// Render a panic payload for logging.
pub fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

// ============================================================================
// Listener Registry
// ============================================================================

/// How one listener handled one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerOutcome {
    Completed,
    Failed(String),
    Panicked(String),
    TimedOut,
}

/// Outcome of a dispatch for a named listener.
#[derive(Debug, Clone)]
pub struct ListenerReport {
    pub listener: String,
    pub outcome: ListenerOutcome,
}

/// Registry for change listeners with lifecycle management.
pub struct ListenerRegistry {
    /// All registered listeners.
    listeners: RwLock<Vec<Arc<dyn ResourceChangeListener>>>,
    /// Listener execution timeout.
    timeout: Duration,
}

impl ListenerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_LISTENER_TIMEOUT)
    }

    /// Create a new registry with custom timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            timeout,
        }
    }

    /// Register a listener.
    pub async fn register(&self, listener: Arc<dyn ResourceChangeListener>) {
        let name = listener.name().to_string();
        self.listeners.write().await.push(listener);
        debug!(listener = %name, "Registered change listener");
    }

    /// Remove a listener by name. Returns true if one was removed.
    pub async fn unregister(&self, name: &str) -> bool {
        let mut listeners = self.listeners.write().await;
        let before = listeners.len();
        listeners.retain(|l| l.name() != name);
        before != listeners.len()
    }

    /// Get the number of registered listeners.
    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    /// Dispatch an event to all interested listeners.
    ///
    /// Each listener runs in an isolated tokio task with:
    /// - Timeout protection
    /// - Panic recovery
    /// - Error isolation (errors don't propagate)
    ///
    /// Returns as soon as the tasks are spawned.
    pub async fn dispatch(&self, event: &ChangeEvent) {
        let spawned = self.spawn_all(event).await;
        if spawned.is_empty() {
            debug!("No listeners matched event");
        }
    }

    /// Dispatch an event and wait for every listener to finish.
    pub async fn dispatch_and_wait(&self, event: &ChangeEvent) -> Vec<ListenerReport> {
        let handles = self.spawn_all(event).await;
        collect_reports(handles).await
    }

    /// Tell every listener that events were dropped before delivery.
    pub async fn notify_missed(&self, missed: u64) -> Vec<ListenerReport> {
        let listeners = self.listeners.read().await.clone();
        let timeout = self.timeout;

        let handles = listeners
            .into_iter()
            .map(|listener| {
                tokio::spawn(async move {
                    let name = listener.name().to_string();
                    let outcome =
                        run_listener(&name, timeout, listener.on_events_missed(missed)).await;
                    ListenerReport {
                        listener: name,
                        outcome,
                    }
                })
            })
            .collect();

        collect_reports(handles).await
    }

    async fn spawn_all(&self, event: &ChangeEvent) -> Vec<JoinHandle<ListenerReport>> {
        let listeners = self.listeners.read().await.clone();
        let timeout = self.timeout;

        let mut handles = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let Some(selected) = listener.select(event) else {
                continue;
            };

            // Each listener runs in an isolated task
            handles.push(tokio::spawn(async move {
                let name = listener.name().to_string();
                let outcome = run_listener(&name, timeout, listener.handle_change(&selected)).await;
                ListenerReport {
                    listener: name,
                    outcome,
                }
            }));
        }
        handles
    }

    /// Call on_start for all listeners.
    pub async fn on_start(&self) {
        let listeners = self.listeners.read().await;
        for listener in listeners.iter() {
            if let Err(e) = listener.on_start().await {
                warn!(listener = %listener.name(), error = %e, "Listener on_start failed");
            }
        }
    }

    /// Call on_shutdown for all listeners.
    pub async fn on_shutdown(&self) {
        let listeners = self.listeners.read().await;
        for listener in listeners.iter() {
            if let Err(e) = listener.on_shutdown().await {
                warn!(listener = %listener.name(), error = %e, "Listener on_shutdown failed");
            }
        }
    }
}

async fn run_listener<F>(name: &str, timeout: Duration, fut: F) -> ListenerOutcome
where
    F: Future<Output = Result<(), ListenerError>>,
{
    match run_isolated(timeout, fut).await {
        Isolated::Completed(Ok(())) => {
            debug!(listener = %name, "Listener executed successfully");
            ListenerOutcome::Completed
        }
        Isolated::Completed(Err(e)) => {
            warn!(listener = %name, error = %e, "Listener execution failed");
            ListenerOutcome::Failed(e.to_string())
        }
        Isolated::Panicked(msg) => {
            error!(listener = %name, panic = %msg, "Listener panicked");
            ListenerOutcome::Panicked(msg)
        }
        Isolated::TimedOut => {
            error!(
                listener = %name,
                timeout_secs = timeout.as_secs(),
                "Listener timed out"
            );
            ListenerOutcome::TimedOut
        }
    }
}

async fn collect_reports(handles: Vec<JoinHandle<ListenerReport>>) -> Vec<ListenerReport> {
    join_all(handles)
        .await
        .into_iter()
        .filter_map(|joined| match joined {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "Listener task aborted");
                None
            }
        })
        .collect()
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Listener Dispatcher
// ============================================================================

/// Dispatcher that consumes events from a broadcast channel and routes them to listeners.
pub struct ListenerDispatcher {
    registry: Arc<ListenerRegistry>,
}

impl ListenerDispatcher {
    /// Create a new dispatcher.
    pub fn new(registry: Arc<ListenerRegistry>) -> Self {
        Self { registry }
    }

    /// Run the dispatcher, consuming events from the receiver.
    ///
    /// Runs until the channel is closed. Lagging is reported to every
    /// listener through `on_events_missed`.
    pub async fn run(self, receiver: broadcast::Receiver<Arc<ChangeEvent>>) {
        let (_keep_open, shutdown) = watch::channel(false);
        self.run_until(receiver, shutdown).await;
    }

    /// Like [`Self::run`], but also stops once `shutdown` turns true or its
    /// sender is dropped.
    pub async fn run_until(
        self,
        mut receiver: broadcast::Receiver<Arc<ChangeEvent>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Starting change listener dispatcher");
        self.registry.on_start().await;

        loop {
            if *shutdown.borrow() {
                info!("Shutdown requested, stopping dispatcher");
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown handle dropped, stopping dispatcher");
                        break;
                    }
                }
                received = receiver.recv() => match received {
                    Ok(event) => {
                        self.registry.dispatch(&event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Dispatcher lagged, missed events");
                        self.registry.notify_missed(n).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Change event channel closed, stopping dispatcher");
                        break;
                    }
                },
            }
        }

        // Graceful shutdown
        self.registry.on_shutdown().await;
    }

    /// Get the registry.
    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }
}

impl std::fmt::Debug for ListenerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerDispatcher")
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::ResourceId;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    struct CountingListener {
        name: &'static str,
        resource_types: Vec<&'static str>,
        count: AtomicU32,
        ids_seen: AtomicU32,
        missed: AtomicU64,
    }

    impl CountingListener {
        fn new(name: &'static str) -> Self {
            Self::for_types(name, vec![])
        }

        fn for_types(name: &'static str, resource_types: Vec<&'static str>) -> Self {
            Self {
                name,
                resource_types,
                count: AtomicU32::new(0),
                ids_seen: AtomicU32::new(0),
                missed: AtomicU64::new(0),
            }
        }

        fn count(&self) -> u32 {
            self.count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ResourceChangeListener for CountingListener {
        fn name(&self) -> &str {
            self.name
        }

        fn resource_types(&self) -> &[&str] {
            &self.resource_types
        }

        async fn handle_change(&self, event: &ChangeEvent) -> Result<(), ListenerError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.ids_seen.fetch_add(event.len() as u32, Ordering::SeqCst);
            Ok(())
        }

        async fn on_events_missed(&self, missed: u64) -> Result<(), ListenerError> {
            self.missed.fetch_add(missed, Ordering::SeqCst);
            Ok(())
        }
    }

    struct PanicListener;

    #[async_trait]
    impl ResourceChangeListener for PanicListener {
        fn name(&self) -> &str {
            "panic_listener"
        }

        async fn handle_change(&self, _event: &ChangeEvent) -> Result<(), ListenerError> {
            panic!("This listener panics!");
        }
    }

    struct FailingListener;

    #[async_trait]
    impl ResourceChangeListener for FailingListener {
        fn name(&self) -> &str {
            "failing_listener"
        }

        async fn handle_change(&self, _event: &ChangeEvent) -> Result<(), ListenerError> {
            Err(ListenerError::execution("boom"))
        }
    }

    struct SlowListener;

    #[async_trait]
    impl ResourceChangeListener for SlowListener {
        fn name(&self) -> &str {
            "slow_listener"
        }

        async fn handle_change(&self, _event: &ChangeEvent) -> Result<(), ListenerError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    fn patient_created(id: &str) -> ChangeEvent {
        ChangeEvent::created(ResourceId::new("Patient", id))
    }

    #[tokio::test]
    async fn test_registry_register_and_unregister() {
        let registry = ListenerRegistry::new();
        assert_eq!(registry.listener_count().await, 0);

        registry
            .register(Arc::new(CountingListener::new("test")))
            .await;
        assert_eq!(registry.listener_count().await, 1);

        assert!(registry.unregister("test").await);
        assert!(!registry.unregister("test").await);
        assert_eq!(registry.listener_count().await, 0);
    }

    #[tokio::test]
    async fn test_registry_dispatch() {
        let registry = ListenerRegistry::new();
        let listener = Arc::new(CountingListener::new("test"));
        registry.register(listener.clone()).await;

        registry.dispatch(&patient_created("123")).await;

        // Give the spawned task time to run
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(listener.count(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_filters_by_resource_type() {
        let registry = ListenerRegistry::new();
        let libraries = Arc::new(CountingListener::for_types("libraries", vec!["Library"]));
        registry.register(libraries.clone()).await;

        let reports = registry.dispatch_and_wait(&patient_created("1")).await;
        assert!(reports.is_empty());
        assert_eq!(libraries.count(), 0);

        let mixed = ChangeEvent::builder()
            .created(ResourceId::new("Patient", "1"))
            .updated(ResourceId::new("Library", "a"))
            .deleted(ResourceId::new("Library", "b"))
            .build()
            .unwrap();
        registry.dispatch_and_wait(&mixed).await;
        assert_eq!(libraries.count(), 1);
        assert_eq!(libraries.ids_seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panic_isolation() {
        let registry = ListenerRegistry::new();
        let counting = Arc::new(CountingListener::new("counter"));

        registry.register(Arc::new(PanicListener)).await;
        registry.register(Arc::new(FailingListener)).await;
        registry.register(counting.clone()).await;

        // This should not panic the test, even though one listener panics
        let reports = registry.dispatch_and_wait(&patient_created("123")).await;

        assert_eq!(counting.count(), 1);
        assert_eq!(reports.len(), 3);

        let outcome_of = |name: &str| {
            reports
                .iter()
                .find(|r| r.listener == name)
                .map(|r| r.outcome.clone())
        };
        assert_eq!(
            outcome_of("panic_listener"),
            Some(ListenerOutcome::Panicked("This listener panics!".into()))
        );
        assert!(matches!(
            outcome_of("failing_listener"),
            Some(ListenerOutcome::Failed(_))
        ));
        assert_eq!(outcome_of("counter"), Some(ListenerOutcome::Completed));
    }

    #[tokio::test]
    async fn test_timeout_isolation() {
        let registry = ListenerRegistry::with_timeout(Duration::from_millis(20));
        let counting = Arc::new(CountingListener::new("counter"));
        registry.register(Arc::new(SlowListener)).await;
        registry.register(counting.clone()).await;

        let reports = registry.dispatch_and_wait(&patient_created("1")).await;
        assert!(
            reports
                .iter()
                .any(|r| r.listener == "slow_listener" && r.outcome == ListenerOutcome::TimedOut)
        );
        assert_eq!(counting.count(), 1);
    }

    #[tokio::test]
    async fn test_notify_missed() {
        let registry = ListenerRegistry::new();
        let listener = Arc::new(CountingListener::new("test"));
        registry.register(listener.clone()).await;

        registry.notify_missed(7).await;
        assert_eq!(listener.missed.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_dispatcher_run() {
        use crate::events::ChangeEventBroadcaster;

        let broadcaster = ChangeEventBroadcaster::new();
        let registry = Arc::new(ListenerRegistry::new());
        let listener = Arc::new(CountingListener::new("test"));
        registry.register(listener.clone()).await;

        let dispatcher = ListenerDispatcher::new(registry.clone());
        let receiver = broadcaster.subscribe();

        // Start dispatcher in background
        tokio::spawn(dispatcher.run(receiver));

        broadcaster.send(patient_created("1"));
        broadcaster.send(patient_created("2"));

        // Give time for processing
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(listener.count(), 2);
    }

    #[tokio::test]
    async fn test_dispatcher_stops_on_shutdown() {
        use crate::events::ChangeEventBroadcaster;

        let broadcaster = ChangeEventBroadcaster::new();
        let registry = Arc::new(ListenerRegistry::new());
        let listener = Arc::new(CountingListener::new("test"));
        registry.register(listener.clone()).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(
            ListenerDispatcher::new(registry).run_until(broadcaster.subscribe(), shutdown_rx),
        );

        broadcaster.send(patient_created("1"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send_replace(true);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("dispatcher should stop")
            .unwrap();
        assert_eq!(listener.count(), 1);
        assert_eq!(broadcaster.send(patient_created("2")), 0);
    }

    #[tokio::test]
    async fn test_run_isolated_variants() {
        let ok = run_isolated(Duration::from_secs(1), async { 5 }).await;
        assert!(matches!(ok, Isolated::Completed(5)));

        let timed_out = run_isolated::<(), _>(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
        })
        .await;
        assert!(matches!(timed_out, Isolated::TimedOut));

        let panicked = run_isolated::<(), _>(Duration::from_secs(1), async {
            panic!("{}", String::from("owned message"));
        })
        .await;
        match panicked {
            Isolated::Panicked(msg) => assert_eq!(msg, "owned message"),
            other => panic!("expected panic, got {other:?}"),
        }
    }
}
