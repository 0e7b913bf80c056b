//! Matching of change events against the published topics.

use std::sync::Arc;
use std::time::Duration;

use octofhir_core::{ChangeEvent, ChangeKind, ResourceId};
use octofhir_storage::{DynReader, StorageError, StoredResource};
use serde_json::Value;
use tracing::{debug, warn};

use crate::matcher::{BoundedMatcher, DEFAULT_MATCHER_TIMEOUT, DynMatcher};
use crate::registry::{TopicRegistry, TopicSnapshot};
use crate::types::{MatchResult, TopicDefinition, Trigger};

/// Timeouts applied while matching.
#[derive(Debug, Clone, Copy)]
pub struct MatchingOptions {
    /// Bound for each storage read of a changed resource.
    pub read_timeout: Duration,
    /// Bound for each criteria evaluation.
    pub matcher_timeout: Duration,
}

impl Default for MatchingOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            matcher_timeout: DEFAULT_MATCHER_TIMEOUT,
        }
    }
}

/// A match together with the post-change body read while matching.
#[derive(Debug, Clone)]
pub struct MatchedChange {
    pub result: MatchResult,
    /// `None` for deletes and for resources that could not be read.
    pub body: Option<Arc<Value>>,
}

/// Decides which topics a change event concerns.
pub struct MatchingSubscriber {
    registry: TopicRegistry,
    reader: DynReader,
    matcher: BoundedMatcher,
    read_timeout: Duration,
}

impl MatchingSubscriber {
    pub fn new(
        registry: TopicRegistry,
        reader: DynReader,
        matcher: DynMatcher,
        options: MatchingOptions,
    ) -> Self {
        Self {
            registry,
            reader,
            matcher: BoundedMatcher::new(matcher, options.matcher_timeout),
            read_timeout: options.read_timeout,
        }
    }

    /// Match every id in `event` against the active topics.
    ///
    /// Yields at most one result per (topic, resource, interaction), in no
    /// particular order.
    pub async fn on_change_event(&self, event: &ChangeEvent) -> Vec<MatchResult> {
        self.match_event(event)
            .await
            .into_iter()
            .map(|m| m.result)
            .collect()
    }

    /// Like [`Self::on_change_event`], keeping the bodies for payload building.
    pub async fn match_event(&self, event: &ChangeEvent) -> Vec<MatchedChange> {
        // One snapshot for the whole event
        let snapshot = self.registry.snapshot();
        if snapshot.is_empty() {
            return Vec::new();
        }

        let mut matches = Vec::new();
        for (kind, id) in event.iter() {
            self.match_id(&snapshot, kind, id, &mut matches).await;
        }

        if !matches.is_empty() {
            debug!(
                generation = snapshot.generation(),
                changes = event.len(),
                matches = matches.len(),
                "Change event matched topics"
            );
        }
        matches
    }

    async fn match_id(
        &self,
        snapshot: &TopicSnapshot,
        kind: ChangeKind,
        id: &ResourceId,
        matches: &mut Vec<MatchedChange>,
    ) {
        if !snapshot.has_triggers_for(&id.resource_type) {
            return;
        }

        let candidates: Vec<&Arc<TopicDefinition>> = snapshot
            .topics_for_type(&id.resource_type)
            .filter(|t| t.is_active())
            .filter(|t| t.triggers_for(&id.resource_type).any(|tr| tr.accepts(kind)))
            .collect();
        if candidates.is_empty() {
            return;
        }

        // Deletes carry identity only
        let current = match kind {
            ChangeKind::Deleted => None,
            _ => self.read_current(id).await,
        };
        let resource_id = match (&id.version_id, &current) {
            (None, Some(stored)) => stored.resource_id(),
            _ => id.clone(),
        };
        let body = current.map(|stored| Arc::new(stored.resource));

        let mut previous = PreviousState::NotLoaded;
        for topic in candidates {
            for trigger in topic
                .triggers_for(&id.resource_type)
                .filter(|tr| tr.accepts(kind))
            {
                if self
                    .trigger_fires(topic, trigger, kind, id, body.as_deref(), &mut previous)
                    .await
                {
                    debug!(topic_id = %topic.id, resource = %id, interaction = %kind, "Topic matched");
                    matches.push(MatchedChange {
                        result: MatchResult {
                            topic_id: topic.id.clone(),
                            topic_url: topic.url.clone(),
                            resource_id: resource_id.clone(),
                            interaction: kind,
                            matched_trigger: trigger.clone(),
                            shape: topic.notification_shape,
                        },
                        body: body.clone(),
                    });
                    // One result per topic
                    break;
                }
            }
        }
    }

    async fn trigger_fires(
        &self,
        topic: &TopicDefinition,
        trigger: &Trigger,
        kind: ChangeKind,
        id: &ResourceId,
        current: Option<&Value>,
        previous: &mut PreviousState,
    ) -> bool {
        if current.is_none() && trigger.is_body_dependent(kind) {
            debug!(topic_id = %topic.id, resource = %id, "Body unavailable, skipping content-dependent trigger");
            return false;
        }

        if let Some(expression) = trigger.criteria_expression.as_deref() {
            let Some(body) = current else {
                return false;
            };
            match self.matcher.matches(body, expression).await {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    warn!(topic_id = %topic.id, resource = %id, error = %e, "Criteria evaluation failed, trigger treated as non-matching");
                    return false;
                }
            }
        }

        if let Some(criteria) = &trigger.query_criteria {
            let prior = match (kind, criteria.previous.is_some()) {
                (ChangeKind::Updated, true) => previous.get(self, id).await,
                _ => None,
            };
            match self
                .matcher
                .evaluate_query(criteria, kind, prior.as_deref(), current)
                .await
            {
                Ok(passed) => return passed,
                Err(e) => {
                    warn!(topic_id = %topic.id, resource = %id, error = %e, "Query criteria evaluation failed, trigger treated as non-matching");
                    return false;
                }
            }
        }

        true
    }

    /// The body the change produced, pinned to the event's version.
    ///
    /// When the backend keeps no history, the current state is used only if
    /// it still is that version.
    async fn read_current(&self, id: &ResourceId) -> Option<StoredResource> {
        let Some(version_id) = id.version_id.as_deref() else {
            return self.bounded_read(id, self.reader.read(id)).await;
        };
        if let Some(Some(stored)) = self
            .bounded_read(id, self.reader.read_version(id, version_id))
            .await
        {
            return Some(stored);
        }
        let current = self.bounded_read(id, self.reader.read(id)).await?;
        if current.version_id == version_id {
            Some(current)
        } else {
            debug!(resource = %id.versioned_reference(), current = %current.version_id, "Event version superseded and not in history, body unavailable");
            None
        }
    }

    /// The state before the change, i.e. the version preceding the first
    /// version the change produced.
    async fn read_previous(&self, id: &ResourceId) -> Option<Arc<Value>> {
        let first = id.first_version();
        self.bounded_read(&first, self.reader.read_previous(&first))
            .await
            .flatten()
            .map(|stored| Arc::new(stored.resource))
    }

    async fn bounded_read<O>(
        &self,
        id: &ResourceId,
        read: impl Future<Output = Result<O, StorageError>>,
    ) -> Option<O> {
        match tokio::time::timeout(self.read_timeout, read).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                log_read_failure(id, &e);
                None
            }
            Err(_) => {
                warn!(resource = %id, timeout_ms = self.read_timeout.as_millis() as u64, "Resource read timed out");
                None
            }
        }
    }
}

fn log_read_failure(id: &ResourceId, error: &StorageError) {
    if error.is_not_found() {
        debug!(resource = %id, "Resource gone before it could be matched");
    } else {
        warn!(resource = %id, category = %error.category(), error = %error, "Failed to read changed resource");
    }
}

/// Prior version, read at most once per id.
enum PreviousState {
    NotLoaded,
    Loaded(Option<Arc<Value>>),
}

impl PreviousState {
    async fn get(&mut self, subscriber: &MatchingSubscriber, id: &ResourceId) -> Option<Arc<Value>> {
        if let PreviousState::Loaded(prior) = self {
            return prior.clone();
        }
        let prior = subscriber.read_previous(id).await;
        *self = PreviousState::Loaded(prior.clone());
        prior
    }
}

impl std::fmt::Debug for MatchingSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchingSubscriber")
            .field("registry", &self.registry)
            .field("backend", &self.reader.backend_name())
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::testing::FieldMatcher;
    use crate::types::{
        NotificationShape, QueryCriteria, QueryResultBehavior, TopicStatus, TriggerInteraction,
    };
    use octofhir_storage::{InMemoryStorage, ResourceWriter};
    use serde_json::json;

    fn topic(id: &str, status: TopicStatus, triggers: Vec<Trigger>) -> TopicDefinition {
        TopicDefinition {
            id: id.to_string(),
            url: Some(format!("http://example.org/topic/{id}")),
            title: None,
            status,
            resource_triggers: triggers,
            notification_shape: NotificationShape::FullResource,
        }
    }

    fn subscriber(storage: Arc<InMemoryStorage>, topics: Vec<TopicDefinition>) -> MatchingSubscriber {
        let registry = TopicRegistry::new();
        registry.publish(topics);
        MatchingSubscriber::new(registry, storage, Arc::new(FieldMatcher), MatchingOptions::default())
    }

    #[tokio::test]
    async fn test_criteria_decide_match() {
        let storage = Arc::new(InMemoryStorage::new());
        let p1 = storage
            .create(&json!({"resourceType": "Patient", "id": "p1", "active": true}))
            .await
            .unwrap();
        let p2 = storage
            .create(&json!({"resourceType": "Patient", "id": "p2", "active": false}))
            .await
            .unwrap();

        let s = subscriber(
            storage,
            vec![topic(
                "t1",
                TopicStatus::Active,
                vec![Trigger::new("Patient", TriggerInteraction::Create).with_criteria("active = true")],
            )],
        );

        let results = s.on_change_event(&ChangeEvent::created(p1.resource_id())).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].topic_id, "t1");
        assert_eq!(results[0].resource_id, ResourceId::new("Patient", "p1"));
        assert_eq!(results[0].interaction, ChangeKind::Created);

        assert!(s.on_change_event(&ChangeEvent::created(p2.resource_id())).await.is_empty());
    }

    #[tokio::test]
    async fn test_one_result_per_topic_and_inactive_topics_ignored() {
        let storage = Arc::new(InMemoryStorage::new());
        let p = storage
            .create(&json!({"resourceType": "Patient", "id": "p1", "active": true, "gender": "female"}))
            .await
            .unwrap();

        let s = subscriber(
            storage,
            vec![
                topic(
                    "both",
                    TopicStatus::Active,
                    vec![
                        Trigger::new("Patient", TriggerInteraction::Any).with_criteria("active = true"),
                        Trigger::new("Patient", TriggerInteraction::Create).with_criteria("gender = female"),
                    ],
                ),
                topic(
                    "draft",
                    TopicStatus::Draft,
                    vec![Trigger::new("Patient", TriggerInteraction::Any)],
                ),
                topic(
                    "observations",
                    TopicStatus::Active,
                    vec![Trigger::new("Observation", TriggerInteraction::Any)],
                ),
            ],
        );

        let results = s.on_change_event(&ChangeEvent::created(p.resource_id())).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].topic_id, "both");
        assert_eq!(results[0].matched_trigger.interaction, TriggerInteraction::Any);
    }

    #[tokio::test]
    async fn test_delete_fires_only_identity_triggers() {
        let storage = Arc::new(InMemoryStorage::new());
        let s = subscriber(
            storage,
            vec![
                topic(
                    "any-delete",
                    TopicStatus::Active,
                    vec![Trigger::new("Patient", TriggerInteraction::Delete)],
                ),
                topic(
                    "filtered-delete",
                    TopicStatus::Active,
                    vec![Trigger::new("Patient", TriggerInteraction::Delete).with_criteria("active = true")],
                ),
                topic(
                    "create-only",
                    TopicStatus::Active,
                    vec![Trigger::new("Patient", TriggerInteraction::Create)],
                ),
            ],
        );

        let matched = s
            .match_event(&ChangeEvent::deleted(ResourceId::new("Patient", "gone")))
            .await;
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].result.topic_id, "any-delete");
        assert!(matched[0].body.is_none());
    }

    #[tokio::test]
    async fn test_vanished_resource_skips_body_triggers() {
        let storage = Arc::new(InMemoryStorage::new());
        let s = subscriber(
            storage,
            vec![
                topic(
                    "plain",
                    TopicStatus::Active,
                    vec![Trigger::new("Patient", TriggerInteraction::Update)],
                ),
                topic(
                    "filtered",
                    TopicStatus::Active,
                    vec![Trigger::new("Patient", TriggerInteraction::Update).with_criteria("active = true")],
                ),
            ],
        );

        // Update event for a resource storage no longer has
        let results = s
            .on_change_event(&ChangeEvent::updated(ResourceId::new("Patient", "ghost")))
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].topic_id, "plain");
    }

    #[tokio::test]
    async fn test_evaluation_error_is_non_matching() {
        let storage = Arc::new(InMemoryStorage::new());
        let p = storage
            .create(&json!({"resourceType": "Patient", "id": "p1", "active": true}))
            .await
            .unwrap();
        let s = subscriber(
            storage,
            vec![topic(
                "t1",
                TopicStatus::Active,
                vec![
                    Trigger::new("Patient", TriggerInteraction::Any).with_criteria("not an expression"),
                    Trigger::new("Patient", TriggerInteraction::Any).with_criteria("active = true"),
                ],
            )],
        );

        let results = s.on_change_event(&ChangeEvent::created(p.resource_id())).await;
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].matched_trigger.criteria_expression.as_deref(),
            Some("active = true")
        );
    }

    #[tokio::test]
    async fn test_query_criteria_use_previous_version() {
        let storage = Arc::new(InMemoryStorage::new());
        storage
            .create(&json!({"resourceType": "Encounter", "id": "e1", "status": "planned"}))
            .await
            .unwrap();
        let started = storage
            .update(&json!({"resourceType": "Encounter", "id": "e1", "status": "in-progress"}))
            .await
            .unwrap();
        let missing = storage
            .update(&json!({"resourceType": "Encounter", "id": "e2", "status": "in-progress"}))
            .await
            .unwrap_err();
        assert!(missing.is_not_found());
        storage
            .create(&json!({"resourceType": "Encounter", "id": "e2", "status": "in-progress"}))
            .await
            .unwrap();
        let still = storage
            .update(&json!({"resourceType": "Encounter", "id": "e2", "status": "in-progress", "priority": "urgent"}))
            .await
            .unwrap();

        let s = subscriber(
            storage,
            vec![topic(
                "admission",
                TopicStatus::Active,
                vec![Trigger::new("Encounter", TriggerInteraction::Update).with_query_criteria(QueryCriteria {
                    previous: Some("status:not=in-progress".into()),
                    result_for_create: QueryResultBehavior::TestPasses,
                    current: Some("status=in-progress".into()),
                    result_for_delete: QueryResultBehavior::TestFails,
                    require_both: true,
                })],
            )],
        );

        // planned -> in-progress is a transition
        let results = s.on_change_event(&ChangeEvent::updated(started.resource_id())).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].resource_id.version_id.as_deref(), Some("2"));

        // in-progress -> in-progress is not
        assert!(s.on_change_event(&ChangeEvent::updated(still.resource_id())).await.is_empty());
    }

    fn admission_topic() -> TopicDefinition {
        topic(
            "admission",
            TopicStatus::Active,
            vec![Trigger::new("Encounter", TriggerInteraction::Update).with_query_criteria(QueryCriteria {
                previous: Some("status:not=in-progress".into()),
                result_for_create: QueryResultBehavior::TestPasses,
                current: Some("status=in-progress".into()),
                result_for_delete: QueryResultBehavior::TestFails,
                require_both: true,
            })],
        )
    }

    #[tokio::test]
    async fn test_folded_updates_compare_against_state_before_the_batch() {
        let storage = Arc::new(InMemoryStorage::new());
        storage
            .create(&json!({"resourceType": "Encounter", "id": "e1", "status": "planned"}))
            .await
            .unwrap();
        let started = storage
            .update(&json!({"resourceType": "Encounter", "id": "e1", "status": "in-progress"}))
            .await
            .unwrap();
        let last = storage
            .update(&json!({"resourceType": "Encounter", "id": "e1", "status": "in-progress", "priority": "urgent"}))
            .await
            .unwrap();

        let s = subscriber(storage, vec![admission_topic()]);

        // Both updates folded into one event naming v3
        let folded = last.resource_id().with_first_version(&started.version_id);
        let results = s.on_change_event(&ChangeEvent::updated(folded)).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].resource_id.version_id.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_late_event_reads_its_own_version() {
        let storage = Arc::new(InMemoryStorage::new());
        storage
            .create(&json!({"resourceType": "Encounter", "id": "e1", "status": "planned"}))
            .await
            .unwrap();
        let started = storage
            .update(&json!({"resourceType": "Encounter", "id": "e1", "status": "in-progress"}))
            .await
            .unwrap();
        storage
            .update(&json!({"resourceType": "Encounter", "id": "e1", "status": "finished"}))
            .await
            .unwrap();

        let s = subscriber(storage, vec![admission_topic()]);

        let matched = s.match_event(&ChangeEvent::updated(started.resource_id())).await;
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].result.resource_id.version_id.as_deref(), Some("2"));
        let body = matched[0].body.as_deref().unwrap();
        assert_eq!(body["status"], "in-progress");
        assert_eq!(body["meta"]["versionId"], "2");
    }

    #[tokio::test]
    async fn test_superseded_version_without_history_has_no_body() {
        /// Serves the current state only.
        struct CurrentOnly(InMemoryStorage);

        #[async_trait::async_trait]
        impl octofhir_storage::ResourceReader for CurrentOnly {
            async fn read(&self, id: &ResourceId) -> Result<StoredResource, StorageError> {
                self.0.read(id).await
            }

            async fn query_active(&self, resource_type: &str) -> Result<Vec<StoredResource>, StorageError> {
                self.0.query_active(resource_type).await
            }

            fn backend_name(&self) -> &'static str {
                "current-only"
            }
        }

        let inner = InMemoryStorage::new();
        let v1 = inner
            .create(&json!({"resourceType": "Patient", "id": "p1", "active": true}))
            .await
            .unwrap();
        inner
            .update(&json!({"resourceType": "Patient", "id": "p1", "active": false}))
            .await
            .unwrap();

        let registry = TopicRegistry::new();
        registry.publish(vec![
            topic(
                "plain",
                TopicStatus::Active,
                vec![Trigger::new("Patient", TriggerInteraction::Create)],
            ),
            topic(
                "filtered",
                TopicStatus::Active,
                vec![Trigger::new("Patient", TriggerInteraction::Create).with_criteria("active = false")],
            ),
        ]);
        let s = MatchingSubscriber::new(
            registry,
            Arc::new(CurrentOnly(inner)),
            Arc::new(FieldMatcher),
            MatchingOptions::default(),
        );

        // The current state belongs to v2, so v1's body is unknown
        let matched = s.match_event(&ChangeEvent::created(v1.resource_id())).await;
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].result.topic_id, "plain");
        assert!(matched[0].body.is_none());
    }

    #[tokio::test]
    async fn test_counts_bounded_by_topics_times_ids() {
        let storage = Arc::new(InMemoryStorage::new());
        let mut builder = ChangeEvent::builder();
        for i in 0..4 {
            let stored = storage
                .create(&json!({"resourceType": "Patient", "id": format!("p{i}"), "active": true}))
                .await
                .unwrap();
            builder = builder.created(stored.resource_id());
        }
        let event = builder.deleted(ResourceId::new("Patient", "old")).build().unwrap();

        let topics: Vec<_> = (0..3)
            .map(|i| {
                topic(
                    &format!("t{i}"),
                    TopicStatus::Active,
                    vec![
                        Trigger::new("Patient", TriggerInteraction::Any),
                        Trigger::new("Patient", TriggerInteraction::Create).with_criteria("active = true"),
                    ],
                )
            })
            .collect();
        let s = subscriber(storage, topics);

        let results = s.on_change_event(&event).await;
        assert!(results.len() <= 3 * event.len());
        assert_eq!(results.len(), 15);

        let mut seen = std::collections::HashSet::new();
        for r in &results {
            assert!(seen.insert((r.topic_id.clone(), r.resource_id.reference(), r.interaction)));
        }
    }
}
