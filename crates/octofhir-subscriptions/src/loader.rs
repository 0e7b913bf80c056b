//! Loading of SubscriptionTopic resources into the topic registry.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use octofhir_storage::DynReader;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::LoadError;
use crate::interceptor::InterceptorBroadcaster;
use crate::parser::parse_topic;
use crate::registry::TopicRegistry;
use crate::types::TopicDefinition;

/// Resource type topic definitions are stored as.
pub const TOPIC_RESOURCE_TYPE: &str = "SubscriptionTopic";

/// Default bound for the topic storage query.
pub const DEFAULT_STORAGE_TIMEOUT: Duration = Duration::from_secs(5);

/// A stored topic left out of the published snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedTopic {
    /// Resource id, when the resource had one.
    pub id: Option<String>,
    pub reason: String,
}

/// Outcome of a successful reload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadReport {
    /// Generation of the snapshot that was published.
    pub generation: u64,
    /// Number of topics in that snapshot.
    pub loaded: usize,
    pub skipped: Vec<SkippedTopic>,
}

/// Reads active topics from storage and republishes the registry.
///
/// Reloads are serialised, which keeps the registry single-writer.
pub struct TopicLoader {
    reader: DynReader,
    registry: TopicRegistry,
    interceptors: Arc<InterceptorBroadcaster>,
    storage_timeout: Duration,
    reload_lock: Mutex<()>,
}

impl TopicLoader {
    pub fn new(
        reader: DynReader,
        registry: TopicRegistry,
        interceptors: Arc<InterceptorBroadcaster>,
    ) -> Self {
        Self {
            reader,
            registry,
            interceptors,
            storage_timeout: DEFAULT_STORAGE_TIMEOUT,
            reload_lock: Mutex::new(()),
        }
    }

    pub fn with_storage_timeout(mut self, timeout: Duration) -> Self {
        self.storage_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    /// Load every active topic and publish them as a new snapshot.
    ///
    /// Malformed topics are skipped and reported; they never abort the load.
    /// On error the previously published snapshot stays in place.
    pub async fn reload(&self) -> Result<ReloadReport, LoadError> {
        let _guard = self.reload_lock.lock().await;

        if let Some(veto) = self.interceptors.before_reload().await {
            let err = LoadError::Vetoed {
                interceptor: veto.interceptor,
                reason: veto.reason,
            };
            self.interceptors.after_reload(Err(&err)).await;
            return Err(err);
        }

        let result = self.load_and_publish().await;
        if let Err(e) = &result {
            warn!(
                error = %e,
                generation = self.registry.snapshot().generation(),
                "Topic reload failed, keeping current snapshot"
            );
        }
        self.interceptors.after_reload(result.as_ref()).await;
        result
    }

    async fn load_and_publish(&self) -> Result<ReloadReport, LoadError> {
        let stored = tokio::time::timeout(
            self.storage_timeout,
            self.reader.query_active(TOPIC_RESOURCE_TYPE),
        )
        .await
        .map_err(|_| LoadError::Timeout(self.storage_timeout))??;

        let mut topics: Vec<TopicDefinition> = Vec::with_capacity(stored.len());
        let mut seen = HashSet::new();
        let mut skipped = Vec::new();

        for resource in &stored {
            let id = Some(resource.id.clone());
            match parse_topic(&resource.resource) {
                Ok(topic) if !topic.is_active() => skipped.push(SkippedTopic {
                    id,
                    reason: format!("status is {}", topic.status.as_str()),
                }),
                Ok(topic) if !seen.insert(topic.id.clone()) => skipped.push(SkippedTopic {
                    id,
                    reason: "duplicate topic id".to_string(),
                }),
                Ok(topic) => topics.push(topic),
                Err(e) => skipped.push(SkippedTopic {
                    id,
                    reason: e.to_string(),
                }),
            }
        }

        for skip in &skipped {
            warn!(
                topic_id = skip.id.as_deref().unwrap_or("<none>"),
                reason = %skip.reason,
                "Skipping subscription topic"
            );
        }

        let loaded = topics.len();
        let generation = self.registry.publish(topics);
        info!(
            generation,
            loaded,
            skipped = skipped.len(),
            "Subscription topics reloaded"
        );

        Ok(ReloadReport {
            generation,
            loaded,
            skipped,
        })
    }
}

impl std::fmt::Debug for TopicLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicLoader")
            .field("registry", &self.registry)
            .field("storage_timeout", &self.storage_timeout)
            .finish_non_exhaustive()
    }
}
