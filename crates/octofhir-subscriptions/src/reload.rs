//! Topic hot-reload.
//!
//! Topic definition changes take effect without a restart:
//!
//! - [`TopicChange`] - events representing topic definition changes
//! - [`TopicChangeNotifier`] - broadcast channel for change notifications
//! - [`TopicChangeListener`] - resource change listener feeding the notifier
//! - [`TopicReloadService`] - reloads with debouncing, periodic refresh and retry
//!
//! # Example
//!
//! ```ignore
//! let notifier = Arc::new(TopicChangeNotifier::new(64));
//! let service = Arc::new(TopicReloadService::new(loader, notifier.clone(), ReloadConfig::default()));
//!
//! tokio::spawn({
//!     let service = service.clone();
//!     async move { service.run().await }
//! });
//!
//! listeners.register(Arc::new(TopicChangeListener::new(notifier))).await;
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use octofhir_core::events::{ListenerError, ResourceChangeListener};
use octofhir_core::{ChangeEvent, ChangeKind};
use tokio::sync::{broadcast, watch};
use tokio::time::{Duration, Instant};

use crate::error::LoadError;
use crate::loader::{ReloadReport, TOPIC_RESOURCE_TYPE, TopicLoader};

// =============================================================================
// Topic Change Types
// =============================================================================

/// Changes that can trigger a topic reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicChange {
    Created { topic_id: String },
    Updated { topic_id: String },
    Deleted { topic_id: String },
    /// Request to reload all topics.
    BulkReload,
}

impl TopicChange {
    pub fn from_change(kind: ChangeKind, topic_id: impl Into<String>) -> Self {
        let topic_id = topic_id.into();
        match kind {
            ChangeKind::Created => Self::Created { topic_id },
            ChangeKind::Updated => Self::Updated { topic_id },
            ChangeKind::Deleted => Self::Deleted { topic_id },
        }
    }

    /// The topic id if this is a single-topic change.
    #[must_use]
    pub fn topic_id(&self) -> Option<&str> {
        match self {
            Self::Created { topic_id } | Self::Updated { topic_id } | Self::Deleted { topic_id } => {
                Some(topic_id)
            }
            Self::BulkReload => None,
        }
    }

    #[must_use]
    pub fn is_bulk_reload(&self) -> bool {
        matches!(self, Self::BulkReload)
    }
}

// =============================================================================
// Topic Change Notifier
// =============================================================================

/// Broadcast channel for topic change notifications.
pub struct TopicChangeNotifier {
    sender: broadcast::Sender<TopicChange>,
}

impl TopicChangeNotifier {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Notify all subscribers. Dropped silently when nobody listens.
    pub fn notify(&self, change: TopicChange) {
        let _ = self.sender.send(change);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TopicChange> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for TopicChangeNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Forwards SubscriptionTopic changes to a [`TopicChangeNotifier`].
pub struct TopicChangeListener {
    notifier: Arc<TopicChangeNotifier>,
}

impl TopicChangeListener {
    pub fn new(notifier: Arc<TopicChangeNotifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl ResourceChangeListener for TopicChangeListener {
    fn name(&self) -> &str {
        "topic_reload_trigger"
    }

    fn resource_types(&self) -> &[&str] {
        &[TOPIC_RESOURCE_TYPE]
    }

    async fn handle_change(&self, event: &ChangeEvent) -> Result<(), ListenerError> {
        for (kind, id) in event.iter() {
            self.notifier.notify(TopicChange::from_change(kind, &id.id));
        }
        Ok(())
    }

    async fn on_events_missed(&self, _missed: u64) -> Result<(), ListenerError> {
        // A missed topic change could be anything
        self.notifier.notify(TopicChange::BulkReload);
        Ok(())
    }
}

// =============================================================================
// Reload Configuration
// =============================================================================

/// Configuration for the topic reload service.
#[derive(Debug, Clone)]
pub struct ReloadConfig {
    /// Debounce time in milliseconds.
    ///
    /// Multiple rapid changes are batched into a single reload.
    pub debounce_ms: u64,

    /// Periodic refresh interval in seconds. 0 disables periodic refresh.
    pub periodic_refresh_secs: u64,

    /// Maximum number of attempts per reload.
    pub max_retry_attempts: usize,

    /// Initial retry backoff in milliseconds, doubled on each retry.
    pub retry_backoff_ms: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            periodic_refresh_secs: 300,
            max_retry_attempts: 3,
            retry_backoff_ms: 1000,
        }
    }
}

impl ReloadConfig {
    #[must_use]
    pub fn without_periodic_refresh() -> Self {
        Self {
            periodic_refresh_secs: 0,
            ..Default::default()
        }
    }

    /// Fast timings for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            debounce_ms: 10,
            periodic_refresh_secs: 0,
            max_retry_attempts: 3,
            retry_backoff_ms: 10,
        }
    }
}

// =============================================================================
// Reload Statistics
// =============================================================================

/// Counters of the reload service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadStats {
    pub reload_attempts: u64,
    pub successful_reloads: u64,
    pub failed_reloads: u64,
    pub notifications_received: u64,
    /// Notifications folded into an already pending reload.
    pub notifications_debounced: u64,
}

// =============================================================================
// Topic Reload Service
// =============================================================================

/// Keeps the topic registry in sync with stored topic definitions.
///
/// The service:
/// - Listens for topic change notifications
/// - Debounces rapid changes into one reload
/// - Periodically refreshes topics (optional)
/// - Retries failed reloads with exponential backoff; vetoed reloads are not retried
pub struct TopicReloadService {
    loader: Arc<TopicLoader>,
    notifier: Arc<TopicChangeNotifier>,
    config: ReloadConfig,
    shutdown: watch::Sender<bool>,

    reload_attempts: AtomicU64,
    successful_reloads: AtomicU64,
    failed_reloads: AtomicU64,
    notifications_received: AtomicU64,
    notifications_debounced: AtomicU64,
}

impl TopicReloadService {
    #[must_use]
    pub fn new(loader: Arc<TopicLoader>, notifier: Arc<TopicChangeNotifier>, config: ReloadConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            loader,
            notifier,
            config,
            shutdown,
            reload_attempts: AtomicU64::new(0),
            successful_reloads: AtomicU64::new(0),
            failed_reloads: AtomicU64::new(0),
            notifications_received: AtomicU64::new(0),
            notifications_debounced: AtomicU64::new(0),
        }
    }

    /// Run until [`Self::shutdown`] is called or the notifier goes away.
    pub async fn run(&self) {
        let mut receiver = self.notifier.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        let debounce_duration = Duration::from_millis(self.config.debounce_ms);
        let periodic_duration = (self.config.periodic_refresh_secs > 0)
            .then(|| Duration::from_secs(self.config.periodic_refresh_secs));

        let mut pending_reload = false;
        let mut last_notification = Instant::now();
        let mut last_periodic_refresh = Instant::now();

        tracing::info!(
            debounce_ms = self.config.debounce_ms,
            periodic_refresh_secs = self.config.periodic_refresh_secs,
            "Topic reload service started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let periodic_remaining = periodic_duration
                .map(|d| d.saturating_sub(last_periodic_refresh.elapsed()))
                .unwrap_or(Duration::MAX);

            let timeout = if pending_reload {
                debounce_duration
                    .saturating_sub(last_notification.elapsed())
                    .min(periodic_remaining)
            } else {
                periodic_remaining
            };

            tokio::select! {
                _ = shutdown.changed() => {}

                result = receiver.recv() => {
                    match result {
                        Ok(change) => {
                            tracing::debug!(change = ?change, "Topic change received");
                            self.notifications_received.fetch_add(1, Ordering::Relaxed);
                            if pending_reload {
                                self.notifications_debounced.fetch_add(1, Ordering::Relaxed);
                            }
                            pending_reload = true;
                            last_notification = Instant::now();
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(missed = n, "Missed topic change notifications");
                            self.notifications_debounced.fetch_add(n, Ordering::Relaxed);
                            pending_reload = true;
                            last_notification = Instant::now();
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::info!("Topic change channel closed");
                            break;
                        }
                    }
                }

                _ = tokio::time::sleep(timeout) => {
                    if pending_reload && last_notification.elapsed() >= debounce_duration {
                        pending_reload = false;
                        self.perform_reload().await;
                        last_periodic_refresh = Instant::now();
                    } else if periodic_duration.is_some_and(|p| last_periodic_refresh.elapsed() >= p) {
                        tracing::debug!("Periodic topic refresh");
                        self.perform_reload().await;
                        last_periodic_refresh = Instant::now();
                    }
                }
            }
        }

        tracing::info!("Topic reload service shutting down");
    }

    async fn perform_reload(&self) {
        if let Err(e) = self.reload_with_retry().await {
            tracing::error!(error = %e, "Topic reload failed after all retries");
        }
    }

    /// Reload topics, retrying retryable failures with exponential backoff.
    pub async fn reload_with_retry(&self) -> Result<ReloadReport, LoadError> {
        let mut attempts = 0;
        let mut backoff = self.config.retry_backoff_ms;

        loop {
            self.reload_attempts.fetch_add(1, Ordering::Relaxed);

            match self.loader.reload().await {
                Ok(report) => {
                    self.successful_reloads.fetch_add(1, Ordering::Relaxed);
                    return Ok(report);
                }
                Err(e) => {
                    attempts += 1;
                    if !e.is_retryable() || attempts >= self.config.max_retry_attempts {
                        self.failed_reloads.fetch_add(1, Ordering::Relaxed);
                        return Err(e);
                    }

                    tracing::warn!(
                        attempt = attempts,
                        max_attempts = self.config.max_retry_attempts,
                        error = %e,
                        backoff_ms = backoff,
                        "Topic reload failed, retrying"
                    );

                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }

    /// Request a full reload through the notifier.
    pub fn trigger_reload(&self) {
        self.notifier.notify(TopicChange::BulkReload);
    }

    /// Signal the service to stop. A running [`Self::run`] returns promptly.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    #[must_use]
    pub fn stats(&self) -> ReloadStats {
        ReloadStats {
            reload_attempts: self.reload_attempts.load(Ordering::Relaxed),
            successful_reloads: self.successful_reloads.load(Ordering::Relaxed),
            failed_reloads: self.failed_reloads.load(Ordering::Relaxed),
            notifications_received: self.notifications_received.load(Ordering::Relaxed),
            notifications_debounced: self.notifications_debounced.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn loader(&self) -> &Arc<TopicLoader> {
        &self.loader
    }

    #[must_use]
    pub fn notifier(&self) -> &Arc<TopicChangeNotifier> {
        &self.notifier
    }
}

// =============================================================================
// Tests
// =============================================================================
