//! Wiring of the topic pipeline components.

use std::sync::Arc;
use std::time::Duration;

use octofhir_core::events::ResourceChangeListener;
use octofhir_storage::DynReader;

use crate::channel::ChannelRegistry;
use crate::deliverer::{DEFAULT_PUBLISH_TIMEOUT, MatchDeliverer};
use crate::error::LoadError;
use crate::interceptor::{DEFAULT_INTERCEPTOR_TIMEOUT, InterceptorBroadcaster};
use crate::listener::TopicMatchingListener;
use crate::loader::{DEFAULT_STORAGE_TIMEOUT, ReloadReport, TopicLoader};
use crate::matcher::DynMatcher;
use crate::registry::TopicRegistry;
use crate::reload::{ReloadConfig, TopicChangeListener, TopicChangeNotifier, TopicReloadService};
use crate::subscriber::{MatchingOptions, MatchingSubscriber};

/// Timeouts and reload behaviour of a [`TopicPipeline`].
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub matching: MatchingOptions,
    pub storage_timeout: Duration,
    pub publish_timeout: Duration,
    pub interceptor_timeout: Duration,
    pub reload: ReloadConfig,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            matching: MatchingOptions::default(),
            storage_timeout: DEFAULT_STORAGE_TIMEOUT,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            interceptor_timeout: DEFAULT_INTERCEPTOR_TIMEOUT,
            reload: ReloadConfig::default(),
        }
    }
}

/// All topic-side components sharing one registry.
///
/// The pipeline does not subscribe itself to change events; hand
/// [`Self::listeners`] to a listener registry and spawn
/// [`TopicReloadService::run`] on [`Self::reload_service`].
pub struct TopicPipeline {
    registry: TopicRegistry,
    channels: Arc<ChannelRegistry>,
    interceptors: Arc<InterceptorBroadcaster>,
    loader: Arc<TopicLoader>,
    matching: Arc<TopicMatchingListener>,
    notifier: Arc<TopicChangeNotifier>,
    reload_service: Arc<TopicReloadService>,
}

impl TopicPipeline {
    pub fn new(reader: DynReader, matcher: DynMatcher, options: PipelineOptions) -> Self {
        let registry = TopicRegistry::new();
        let channels = Arc::new(ChannelRegistry::new());
        let interceptors = Arc::new(InterceptorBroadcaster::with_timeout(options.interceptor_timeout));

        let loader = Arc::new(
            TopicLoader::new(reader.clone(), registry.clone(), interceptors.clone())
                .with_storage_timeout(options.storage_timeout),
        );

        let subscriber = MatchingSubscriber::new(registry.clone(), reader, matcher, options.matching);
        let deliverer = MatchDeliverer::with_timeout(interceptors.clone(), options.publish_timeout);
        let matching = Arc::new(TopicMatchingListener::new(subscriber, deliverer, channels.clone()));

        let notifier = Arc::new(TopicChangeNotifier::default());
        let reload_service = Arc::new(TopicReloadService::new(
            loader.clone(),
            notifier.clone(),
            options.reload,
        ));

        Self {
            registry,
            channels,
            interceptors,
            loader,
            matching,
            notifier,
            reload_service,
        }
    }

    /// Listeners to register for change events: the matching listener and
    /// the topic reload trigger.
    pub fn listeners(&self) -> Vec<Arc<dyn ResourceChangeListener>> {
        let matching: Arc<dyn ResourceChangeListener> = self.matching.clone();
        let reload_trigger: Arc<dyn ResourceChangeListener> =
            Arc::new(TopicChangeListener::new(self.notifier.clone()));
        vec![matching, reload_trigger]
    }

    /// Load topics once, outside the reload service.
    pub async fn reload(&self) -> Result<ReloadReport, LoadError> {
        self.loader.reload().await
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    pub fn interceptors(&self) -> &Arc<InterceptorBroadcaster> {
        &self.interceptors
    }

    pub fn matching_listener(&self) -> &Arc<TopicMatchingListener> {
        &self.matching
    }

    pub fn reload_service(&self) -> &Arc<TopicReloadService> {
        &self.reload_service
    }
}

impl std::fmt::Debug for TopicPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicPipeline")
            .field("registry", &self.registry)
            .field("channels", &self.channels)
            .field("interceptors", &self.interceptors)
            .finish_non_exhaustive()
    }
}
