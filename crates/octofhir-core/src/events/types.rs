//! Change event types shared by storage producers and listeners.
//!
//! A [`ChangeEvent`] describes one batch of storage mutations as three sets of
//! [`ResourceId`]s. Events are immutable once built and every id belongs to at
//! most one of the three sets; construction rejects anything else.

use std::hash::{Hash, Hasher};

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::CoreError;

// ============================================================================
// Resource identity
// ============================================================================

/// Storage identity of a resource.
///
/// Equality and hashing use `(resource_type, id)` only. The versions are
/// carried for logging and history lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceId {
    pub resource_type: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    /// First version produced by a change folded from several writes.
    /// `None` when the change produced `version_id` alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_version_id: Option<String>,
}

impl ResourceId {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version_id: None,
            first_version_id: None,
        }
    }

    /// Attach a version id.
    pub fn with_version(mut self, version_id: impl Into<String>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }

    /// Record the first version of a folded change.
    pub fn with_first_version(mut self, first_version_id: impl Into<String>) -> Self {
        self.first_version_id = Some(first_version_id.into());
        self
    }

    /// This id pinned to the first version its change produced. The version
    /// before that one is the state the change started from.
    pub fn first_version(&self) -> ResourceId {
        ResourceId {
            resource_type: self.resource_type.clone(),
            id: self.id.clone(),
            version_id: self.first_version_id.clone().or_else(|| self.version_id.clone()),
            first_version_id: None,
        }
    }

    /// Relative reference, e.g. `Patient/123`.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }

    /// Relative reference including the version when known,
    /// e.g. `Patient/123/_history/2`.
    pub fn versioned_reference(&self) -> String {
        match &self.version_id {
            Some(v) => format!("{}/{}/_history/{}", self.resource_type, self.id, v),
            None => self.reference(),
        }
    }
}

impl PartialEq for ResourceId {
    fn eq(&self, other: &Self) -> bool {
        self.resource_type == other.resource_type && self.id == other.id
    }
}

impl Eq for ResourceId {}

impl Hash for ResourceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.resource_type.hash(state);
        self.id.hash(state);
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

// ============================================================================
// Change kind
// ============================================================================

/// Category of a change within an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Change event
// ============================================================================

/// Immutable batch of created, updated and deleted resource ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawChangeEvent", into = "RawChangeEvent")]
pub struct ChangeEvent {
    created: IndexSet<ResourceId>,
    updated: IndexSet<ResourceId>,
    deleted: IndexSet<ResourceId>,
    occurred_at: OffsetDateTime,
}

impl ChangeEvent {
    /// Build an event from the three id collections.
    ///
    /// Absent collections are treated as empty. Duplicates inside one
    /// collection collapse. An id present in two collections is an upstream
    /// contract breach and is rejected with [`CoreError::InvariantViolation`].
    pub fn new<C, U, D>(
        created: Option<C>,
        updated: Option<U>,
        deleted: Option<D>,
    ) -> Result<Self, CoreError>
    where
        C: IntoIterator<Item = ResourceId>,
        U: IntoIterator<Item = ResourceId>,
        D: IntoIterator<Item = ResourceId>,
    {
        let created: IndexSet<ResourceId> = created.into_iter().flatten().collect();
        let updated: IndexSet<ResourceId> = updated.into_iter().flatten().collect();
        let deleted: IndexSet<ResourceId> = deleted.into_iter().flatten().collect();

        let overlap = created
            .iter()
            .filter(|id| updated.contains(*id))
            .map(|id| (id, ChangeKind::Created, ChangeKind::Updated))
            .chain(
                created
                    .iter()
                    .filter(|id| deleted.contains(*id))
                    .map(|id| (id, ChangeKind::Created, ChangeKind::Deleted)),
            )
            .chain(
                updated
                    .iter()
                    .filter(|id| deleted.contains(*id))
                    .map(|id| (id, ChangeKind::Updated, ChangeKind::Deleted)),
            )
            .next();
        if let Some((id, first, second)) = overlap {
            return Err(CoreError::invariant_violation(format!(
                "change event lists {id} as both {first} and {second}"
            )));
        }

        Ok(Self {
            created,
            updated,
            deleted,
            occurred_at: OffsetDateTime::now_utc(),
        })
    }

    /// Start building an event id by id.
    pub fn builder() -> ChangeEventBuilder {
        ChangeEventBuilder::default()
    }

    /// Event with a single created id.
    pub fn created(id: ResourceId) -> Self {
        Self::single(ChangeKind::Created, id)
    }

    /// Event with a single updated id.
    pub fn updated(id: ResourceId) -> Self {
        Self::single(ChangeKind::Updated, id)
    }

    /// Event with a single deleted id.
    pub fn deleted(id: ResourceId) -> Self {
        Self::single(ChangeKind::Deleted, id)
    }

    fn single(kind: ChangeKind, id: ResourceId) -> Self {
        let mut set = IndexSet::with_capacity(1);
        set.insert(id);
        let mut event = Self {
            created: IndexSet::new(),
            updated: IndexSet::new(),
            deleted: IndexSet::new(),
            occurred_at: OffsetDateTime::now_utc(),
        };
        match kind {
            ChangeKind::Created => event.created = set,
            ChangeKind::Updated => event.updated = set,
            ChangeKind::Deleted => event.deleted = set,
        }
        event
    }

    pub fn created_ids(&self) -> &IndexSet<ResourceId> {
        &self.created
    }

    pub fn updated_ids(&self) -> &IndexSet<ResourceId> {
        &self.updated
    }

    pub fn deleted_ids(&self) -> &IndexSet<ResourceId> {
        &self.deleted
    }

    pub fn occurred_at(&self) -> OffsetDateTime {
        self.occurred_at
    }

    /// Ids of the given kind.
    pub fn ids(&self, kind: ChangeKind) -> &IndexSet<ResourceId> {
        match kind {
            ChangeKind::Created => &self.created,
            ChangeKind::Updated => &self.updated,
            ChangeKind::Deleted => &self.deleted,
        }
    }

    /// Iterate every id with its change kind: created, then updated, then deleted.
    pub fn iter(&self) -> impl Iterator<Item = (ChangeKind, &ResourceId)> {
        self.created
            .iter()
            .map(|id| (ChangeKind::Created, id))
            .chain(self.updated.iter().map(|id| (ChangeKind::Updated, id)))
            .chain(self.deleted.iter().map(|id| (ChangeKind::Deleted, id)))
    }

    /// Total number of changed ids.
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kind of change recorded for `id`, if any.
    pub fn kind_of(&self, id: &ResourceId) -> Option<ChangeKind> {
        if self.created.contains(id) {
            Some(ChangeKind::Created)
        } else if self.updated.contains(id) {
            Some(ChangeKind::Updated)
        } else if self.deleted.contains(id) {
            Some(ChangeKind::Deleted)
        } else {
            None
        }
    }

    /// Restrict the event to the given resource types.
    ///
    /// An empty filter keeps everything. The restricted event keeps the
    /// original timestamp.
    pub fn restricted_to(&self, resource_types: &[&str]) -> ChangeEvent {
        if resource_types.is_empty() {
            return self.clone();
        }
        let keep = |id: &&ResourceId| resource_types.contains(&id.resource_type.as_str());
        Self {
            created: self.created.iter().filter(keep).cloned().collect(),
            updated: self.updated.iter().filter(keep).cloned().collect(),
            deleted: self.deleted.iter().filter(keep).cloned().collect(),
            occurred_at: self.occurred_at,
        }
    }

    /// Drop ids of the given resource types.
    pub fn without_types(&self, resource_types: &[&str]) -> ChangeEvent {
        let keep = |id: &&ResourceId| !resource_types.contains(&id.resource_type.as_str());
        Self {
            created: self.created.iter().filter(keep).cloned().collect(),
            updated: self.updated.iter().filter(keep).cloned().collect(),
            deleted: self.deleted.iter().filter(keep).cloned().collect(),
            occurred_at: self.occurred_at,
        }
    }
}

/// Incremental builder for multi-id events.
#[derive(Debug, Default)]
pub struct ChangeEventBuilder {
    created: Vec<ResourceId>,
    updated: Vec<ResourceId>,
    deleted: Vec<ResourceId>,
}

impl ChangeEventBuilder {
    pub fn created(mut self, id: ResourceId) -> Self {
        self.created.push(id);
        self
    }

    pub fn updated(mut self, id: ResourceId) -> Self {
        self.updated.push(id);
        self
    }

    pub fn deleted(mut self, id: ResourceId) -> Self {
        self.deleted.push(id);
        self
    }

    pub fn push(mut self, kind: ChangeKind, id: ResourceId) -> Self {
        match kind {
            ChangeKind::Created => self.created.push(id),
            ChangeKind::Updated => self.updated.push(id),
            ChangeKind::Deleted => self.deleted.push(id),
        }
        self
    }

    pub fn build(self) -> Result<ChangeEvent, CoreError> {
        ChangeEvent::new(Some(self.created), Some(self.updated), Some(self.deleted))
    }
}

/// Wire form of [`ChangeEvent`]. Missing or `null` collections decode as empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChangeEvent {
    #[serde(default)]
    created: Option<Vec<ResourceId>>,
    #[serde(default)]
    updated: Option<Vec<ResourceId>>,
    #[serde(default)]
    deleted: Option<Vec<ResourceId>>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    occurred_at: Option<OffsetDateTime>,
}

impl TryFrom<RawChangeEvent> for ChangeEvent {
    type Error = CoreError;

    fn try_from(raw: RawChangeEvent) -> Result<Self, Self::Error> {
        let mut event = ChangeEvent::new(raw.created, raw.updated, raw.deleted)?;
        if let Some(ts) = raw.occurred_at {
            event.occurred_at = ts;
        }
        Ok(event)
    }
}

impl From<ChangeEvent> for RawChangeEvent {
    fn from(event: ChangeEvent) -> Self {
        Self {
            created: Some(event.created.into_iter().collect()),
            updated: Some(event.updated.into_iter().collect()),
            deleted: Some(event.deleted.into_iter().collect()),
            occurred_at: Some(event.occurred_at),
        }
    }
}
