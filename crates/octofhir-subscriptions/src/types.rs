//! Core types for topic-based subscriptions.

use std::sync::Arc;

use octofhir_core::{ChangeKind, ResourceId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Topic definition
// ============================================================================

/// Parsed SubscriptionTopic, immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicDefinition {
    /// Logical id of the SubscriptionTopic resource.
    pub id: String,

    /// Canonical URL, when declared.
    pub url: Option<String>,

    /// Human-readable title.
    pub title: Option<String>,

    pub status: TopicStatus,

    pub resource_triggers: Vec<Trigger>,

    /// How much of the focus resource notifications carry.
    pub notification_shape: NotificationShape,
}

impl TopicDefinition {
    pub fn is_active(&self) -> bool {
        self.status == TopicStatus::Active
    }

    /// Triggers declared for `resource_type`.
    pub fn triggers_for<'a>(&'a self, resource_type: &'a str) -> impl Iterator<Item = &'a Trigger> {
        self.resource_triggers
            .iter()
            .filter(move |t| t.resource_type == resource_type)
    }
}

/// Topic publication status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicStatus {
    #[default]
    Draft,
    Active,
    Retired,
}

impl TopicStatus {
    /// Parse a FHIR publication status code.
    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "draft" => Some(TopicStatus::Draft),
            "active" => Some(TopicStatus::Active),
            "retired" => Some(TopicStatus::Retired),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TopicStatus::Draft => "draft",
            TopicStatus::Active => "active",
            TopicStatus::Retired => "retired",
        }
    }
}

// ============================================================================
// Triggers
// ============================================================================

/// One clause of a topic: which resource type, which interaction, which criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub resource_type: String,

    pub interaction: TriggerInteraction,

    /// FHIRPath expression evaluated against the post-change resource.
    pub criteria_expression: Option<String>,

    /// Search-style criteria evaluated against the before and after states.
    pub query_criteria: Option<QueryCriteria>,

    pub description: Option<String>,
}

impl Trigger {
    pub fn new(resource_type: impl Into<String>, interaction: TriggerInteraction) -> Self {
        Self {
            resource_type: resource_type.into(),
            interaction,
            criteria_expression: None,
            query_criteria: None,
            description: None,
        }
    }

    pub fn with_criteria(mut self, expression: impl Into<String>) -> Self {
        self.criteria_expression = Some(expression.into());
        self
    }

    pub fn with_query_criteria(mut self, criteria: QueryCriteria) -> Self {
        self.query_criteria = Some(criteria);
        self
    }

    /// Whether this trigger fires for the given change kind.
    pub fn accepts(&self, kind: ChangeKind) -> bool {
        self.interaction.accepts(kind)
    }

    /// Whether deciding this trigger for `kind` needs resource content.
    ///
    /// Such triggers cannot fire when the body is unavailable, which is
    /// always the case for deletes.
    pub fn is_body_dependent(&self, kind: ChangeKind) -> bool {
        if self.criteria_expression.is_some() {
            return true;
        }
        match &self.query_criteria {
            Some(q) => {
                (q.current.is_some() && kind != ChangeKind::Deleted)
                    || (q.previous.is_some() && kind != ChangeKind::Created)
            }
            None => false,
        }
    }
}

/// Interaction a trigger listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerInteraction {
    Create,
    Update,
    Delete,
    Any,
}

impl TriggerInteraction {
    /// Parse a FHIR interaction code. `any` is not a FHIR code.
    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "create" => Some(TriggerInteraction::Create),
            "update" => Some(TriggerInteraction::Update),
            "delete" => Some(TriggerInteraction::Delete),
            _ => None,
        }
    }

    pub fn accepts(&self, kind: ChangeKind) -> bool {
        matches!(
            (self, kind),
            (TriggerInteraction::Any, _)
                | (TriggerInteraction::Create, ChangeKind::Created)
                | (TriggerInteraction::Update, ChangeKind::Updated)
                | (TriggerInteraction::Delete, ChangeKind::Deleted)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerInteraction::Create => "create",
            TriggerInteraction::Update => "update",
            TriggerInteraction::Delete => "delete",
            TriggerInteraction::Any => "any",
        }
    }
}

/// Before/after criteria of a trigger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryCriteria {
    /// Query applied to the state before the change.
    pub previous: Option<String>,

    /// Result assumed for `previous` on create.
    pub result_for_create: QueryResultBehavior,

    /// Query applied to the state after the change.
    pub current: Option<String>,

    /// Result assumed for `current` on delete.
    pub result_for_delete: QueryResultBehavior,

    /// Both tested sides must pass instead of either.
    pub require_both: bool,
}

/// Outcome assumed for a query side that cannot be evaluated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryResultBehavior {
    TestPasses,
    TestFails,
    #[default]
    NoTest,
}

impl QueryResultBehavior {
    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "test-passes" => Some(QueryResultBehavior::TestPasses),
            "test-fails" => Some(QueryResultBehavior::TestFails),
            "no-test" => Some(QueryResultBehavior::NoTest),
            _ => None,
        }
    }

    /// `None` means the side is left out of the combination.
    pub fn as_outcome(&self) -> Option<bool> {
        match self {
            QueryResultBehavior::TestPasses => Some(true),
            QueryResultBehavior::TestFails => Some(false),
            QueryResultBehavior::NoTest => None,
        }
    }
}

/// Content level of notifications for a topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationShape {
    #[default]
    FullResource,
    IdOnly,
    Empty,
}

impl NotificationShape {
    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "full-resource" => Some(NotificationShape::FullResource),
            "id-only" => Some(NotificationShape::IdOnly),
            "empty" => Some(NotificationShape::Empty),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationShape::FullResource => "full-resource",
            NotificationShape::IdOnly => "id-only",
            NotificationShape::Empty => "empty",
        }
    }
}

// ============================================================================
// Matching and payloads
// ============================================================================

/// One (topic, resource, interaction) hit produced while matching a change event.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub topic_id: String,
    pub topic_url: Option<String>,
    pub resource_id: ResourceId,
    pub interaction: ChangeKind,
    /// The first trigger of the topic that matched.
    pub matched_trigger: Trigger,
    pub shape: NotificationShape,
}

/// What a notification carries about the focus resource.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadContent {
    /// The full post-change resource body.
    Resource(Arc<Value>),
    /// Only the focus identity.
    ResourceId(ResourceId),
    /// Topic and interaction only.
    Empty,
}

/// Notification ready for delivery. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationPayload {
    pub topic_id: String,
    pub topic_url: Option<String>,
    pub interaction: ChangeKind,
    pub content: PayloadContent,
    /// Versioned relative reference to the focus resource. Absent for `empty`.
    pub focus_reference: Option<String>,
}

impl NotificationPayload {
    pub fn shape(&self) -> NotificationShape {
        match self.content {
            PayloadContent::Resource(_) => NotificationShape::FullResource,
            PayloadContent::ResourceId(_) => NotificationShape::IdOnly,
            PayloadContent::Empty => NotificationShape::Empty,
        }
    }

    /// Render as a FHIR `subscription-notification` Bundle.
    ///
    /// `events_since_start` becomes the event number. The result depends only
    /// on the payload and that number, so retries render identical bundles.
    pub fn to_bundle(&self, events_since_start: u64) -> Value {
        let topic = self.topic_url.clone().unwrap_or_else(|| self.topic_id.clone());

        let mut notification_event = serde_json::json!({
            "eventNumber": events_since_start.to_string(),
        });
        if let Some(focus) = &self.focus_reference {
            notification_event["focus"] = serde_json::json!({ "reference": focus });
        }

        let status = serde_json::json!({
            "resourceType": "SubscriptionStatus",
            "status": "active",
            "type": "event-notification",
            "eventsSinceSubscriptionStart": events_since_start.to_string(),
            "notificationEvent": [notification_event],
            "topic": topic,
        });

        let mut entries = vec![serde_json::json!({
            "fullUrl": format!("urn:topic:{}:event:{}", self.topic_id, events_since_start),
            "resource": status,
        })];

        if let PayloadContent::Resource(body) = &self.content {
            let mut entry = serde_json::json!({ "resource": body.as_ref() });
            if let Some(focus) = &self.focus_reference {
                entry["fullUrl"] = Value::String(focus.clone());
            }
            entries.push(entry);
        }

        serde_json::json!({
            "resourceType": "Bundle",
            "type": "subscription-notification",
            "entry": entries,
        })
    }
}
