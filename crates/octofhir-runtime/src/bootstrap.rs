//! Startup and shutdown of the change notification runtime.

use std::sync::Arc;

use octofhir_cache::{LibraryCache, library_invalidation_listener};
use octofhir_config::{AppConfig, SubscriptionSettings};
use octofhir_core::events::{ChangeEventBroadcaster, ListenerDispatcher, ListenerRegistry};
use octofhir_storage::{EventedStorage, ResourceReader, ResourceWriter};
use octofhir_subscriptions::{
    ChannelRegistry, DynMatcher, InterceptorBroadcaster, MatchingOptions, PipelineOptions,
    ReloadConfig, TopicPipeline, TopicRegistry,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Map subscription settings onto pipeline options.
pub fn pipeline_options(settings: &SubscriptionSettings) -> PipelineOptions {
    PipelineOptions {
        matching: MatchingOptions {
            read_timeout: settings.storage_timeout(),
            matcher_timeout: settings.matcher_timeout(),
        },
        storage_timeout: settings.storage_timeout(),
        publish_timeout: settings.publish_timeout(),
        interceptor_timeout: settings.interceptor_timeout(),
        reload: ReloadConfig {
            debounce_ms: settings.reload_debounce_ms,
            periodic_refresh_secs: settings.reload_interval_secs,
            max_retry_attempts: settings.reload_max_retries as usize,
            retry_backoff_ms: settings.reload_backoff_ms,
        },
    }
}

/// Running change notification components over one storage backend.
///
/// Writes made through [`Self::storage`] are broadcast as change events and
/// dispatched to the topic matching listener, the topic reload trigger and,
/// when enabled, the library cache invalidation listener.
pub struct ChangeNotificationRuntime<S> {
    config: AppConfig,
    storage: Arc<EventedStorage<S>>,
    broadcaster: Arc<ChangeEventBroadcaster>,
    listeners: Arc<ListenerRegistry>,
    pipeline: TopicPipeline,
    library_cache: Arc<LibraryCache>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl<S> ChangeNotificationRuntime<S>
where
    S: ResourceReader + ResourceWriter + 'static,
{
    /// Build and start every component.
    ///
    /// The initial topic load never fails startup: on error the registry
    /// stays empty until the reload service succeeds.
    pub async fn start(config: AppConfig, storage: S, matcher: DynMatcher) -> Self {
        let broadcaster = Arc::new(ChangeEventBroadcaster::with_capacity(config.events.buffer_size));
        let storage = Arc::new(EventedStorage::new(storage, broadcaster.clone()));
        let listeners = Arc::new(ListenerRegistry::with_timeout(config.events.listener_timeout()));

        let pipeline = TopicPipeline::new(
            storage.clone(),
            matcher,
            pipeline_options(&config.subscriptions),
        );
        let library_cache = Arc::new(LibraryCache::new());

        if config.subscriptions.enabled {
            for listener in pipeline.listeners() {
                listeners.register(listener).await;
            }
            match pipeline.reload().await {
                Ok(report) => info!(
                    generation = report.generation,
                    loaded = report.loaded,
                    skipped = report.skipped.len(),
                    "Initial subscription topics loaded"
                ),
                Err(e) => error!(error = %e, "Initial topic load failed, starting with no topics"),
            }
        }

        if config.cache.library_invalidation {
            let listener = library_invalidation_listener(
                storage.clone(),
                library_cache.clone(),
                config.cache.resolve_timeout(),
            );
            listeners.register(Arc::new(listener)).await;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let dispatcher = ListenerDispatcher::new(listeners.clone());
        tasks.push(tokio::spawn(
            dispatcher.run_until(broadcaster.subscribe(), shutdown_rx),
        ));

        if config.subscriptions.enabled {
            let service = pipeline.reload_service().clone();
            tasks.push(tokio::spawn(async move { service.run().await }));
        }

        let listener_count = listeners.listener_count().await;
        info!(
            backend = storage.backend_name(),
            listeners = listener_count,
            subscriptions = config.subscriptions.enabled,
            library_invalidation = config.cache.library_invalidation,
            "Change notification runtime started"
        );

        Self {
            config,
            storage,
            broadcaster,
            listeners,
            pipeline,
            library_cache,
            shutdown,
            tasks,
        }
    }

    /// Stop the reload service and the dispatcher and wait for both.
    pub async fn shutdown(self) {
        info!("Shutting down change notification runtime");
        self.shutdown.send_replace(true);
        self.pipeline.reload_service().shutdown();

        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Runtime task ended abnormally");
            }
        }
        info!("Change notification runtime stopped");
    }
}

impl<S> ChangeNotificationRuntime<S> {
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Storage whose writes produce change events.
    pub fn storage(&self) -> &Arc<EventedStorage<S>> {
        &self.storage
    }

    pub fn broadcaster(&self) -> &Arc<ChangeEventBroadcaster> {
        &self.broadcaster
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    pub fn pipeline(&self) -> &TopicPipeline {
        &self.pipeline
    }

    pub fn topic_registry(&self) -> &TopicRegistry {
        self.pipeline.registry()
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        self.pipeline.channels()
    }

    pub fn interceptors(&self) -> &Arc<InterceptorBroadcaster> {
        self.pipeline.interceptors()
    }

    pub fn library_cache(&self) -> &Arc<LibraryCache> {
        &self.library_cache
    }
}

impl<S> std::fmt::Debug for ChangeNotificationRuntime<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotificationRuntime")
            .field("pipeline", &self.pipeline)
            .field("library_cache", &self.library_cache)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}
