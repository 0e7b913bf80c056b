//! EventedStorage - a storage wrapper that emits change events after writes.
//!
//! This wrapper delegates all operations to an inner storage implementation
//! while publishing a [`ChangeEvent`] after each successful write. Batches
//! are folded into a single event.
//!
//! # Example
//!
//! ```ignore
//! use octofhir_storage::{EventedStorage, InMemoryStorage};
//! use octofhir_core::events::ChangeEventBroadcaster;
//!
//! let broadcaster = ChangeEventBroadcaster::new_shared();
//! let storage = EventedStorage::new(InMemoryStorage::new(), broadcaster);
//!
//! // After this, a change event is published on the broadcaster
//! storage.create(&patient_json).await?;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use octofhir_core::events::{ChangeEvent, ChangeEventBroadcaster, ChangeKind, ResourceId};
use serde_json::Value;
use tracing::{debug, error};

use crate::error::StorageError;
use crate::traits::{ResourceReader, ResourceWriter};
use crate::types::StoredResource;

/// A storage wrapper that emits change events after successful writes.
///
/// Events are emitted **after** the operation succeeds, so every event
/// corresponds to a change that actually reached the inner storage.
pub struct EventedStorage<S> {
    /// The inner storage implementation.
    inner: S,
    /// The event broadcaster.
    broadcaster: Arc<ChangeEventBroadcaster>,
}

impl<S> EventedStorage<S> {
    /// Create a new evented storage wrapper.
    pub fn new(inner: S, broadcaster: Arc<ChangeEventBroadcaster>) -> Self {
        Self { inner, broadcaster }
    }

    /// Get a reference to the inner storage.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Get a reference to the broadcaster.
    pub fn broadcaster(&self) -> &Arc<ChangeEventBroadcaster> {
        &self.broadcaster
    }

    fn emit(&self, event: ChangeEvent) {
        if !self.broadcaster.has_subscribers() {
            return;
        }
        let ids = event.len();
        let count = self.broadcaster.send(event);
        debug!(ids, subscribers = count, "Emitted change event");
    }
}

impl<S: ResourceWriter> EventedStorage<S> {
    /// Apply several writes and publish them as one change event.
    ///
    /// Writes are applied in order and stop at the first failure; the writes
    /// that did succeed are still published before the error is returned.
    pub async fn commit_batch(&self, ops: Vec<WriteOp>) -> Result<Vec<StoredResource>, StorageError> {
        let mut changes = PendingChanges::default();
        let mut stored = Vec::with_capacity(ops.len());
        let mut failure = None;

        for op in ops {
            let applied = match op {
                WriteOp::Create(body) => self.inner.create(&body).await.map(|r| {
                    changes.record(ChangeKind::Created, r.resource_id());
                    stored.push(r);
                }),
                WriteOp::Update(body) => self.inner.update(&body).await.map(|r| {
                    changes.record(ChangeKind::Updated, r.resource_id());
                    stored.push(r);
                }),
                WriteOp::Delete { resource_type, id } => {
                    self.inner.delete(&resource_type, &id).await.map(|()| {
                        changes.record(ChangeKind::Deleted, ResourceId::new(resource_type, id));
                    })
                }
            };
            if let Err(e) = applied {
                failure = Some(e);
                break;
            }
        }

        match changes.into_event() {
            Ok(event) => self.emit(event),
            Err(e) => error!(error = %e, "Dropped malformed batch change event"),
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(stored),
        }
    }
}

/// One write inside a batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Create(Value),
    Update(Value),
    Delete { resource_type: String, id: String },
}

/// Accumulates per-id changes so a batch yields a well-formed event.
///
/// Repeated writes to one id collapse to their net effect: create then
/// update is a create, create then delete is nothing, update then delete is
/// a delete, delete then create is an update. Repeated updates keep the
/// first version they produced in [`ResourceId::first_version_id`].
#[derive(Debug, Default)]
struct PendingChanges {
    changes: IndexMap<ResourceId, ChangeKind>,
}

impl PendingChanges {
    fn record(&mut self, kind: ChangeKind, id: ResourceId) {
        use ChangeKind::*;
        let Some((earlier, earlier_kind)) = self.changes.shift_remove_entry(&id) else {
            self.changes.insert(id, kind);
            return;
        };
        let net = match (earlier_kind, kind) {
            (Created, Updated) => Some(Created),
            (Created, Deleted) => None,
            (Updated, Deleted) => Some(Deleted),
            (Deleted, Created) => Some(Updated),
            (_, k) => Some(k),
        };
        // The key carries the newest version; folded updates also remember
        // the first version so readers can find the state before the batch.
        let id = match (earlier_kind, net) {
            (Updated, Some(Updated)) => match earlier.first_version().version_id {
                Some(first) => id.with_first_version(first),
                None => id,
            },
            _ => id,
        };
        if let Some(k) = net {
            self.changes.insert(id, k);
        }
    }

    fn into_event(self) -> Result<ChangeEvent, octofhir_core::CoreError> {
        self.changes
            .into_iter()
            .fold(ChangeEvent::builder(), |b, (id, kind)| b.push(kind, id))
            .build()
    }
}

#[async_trait]
impl<S: ResourceReader> ResourceReader for EventedStorage<S> {
    async fn read(&self, id: &ResourceId) -> Result<StoredResource, StorageError> {
        // Read operations don't emit events
        self.inner.read(id).await
    }

    async fn read_version(
        &self,
        id: &ResourceId,
        version_id: &str,
    ) -> Result<Option<StoredResource>, StorageError> {
        self.inner.read_version(id, version_id).await
    }

    async fn read_previous(&self, id: &ResourceId) -> Result<Option<StoredResource>, StorageError> {
        self.inner.read_previous(id).await
    }

    async fn read_history(&self, id: &ResourceId) -> Result<Vec<StoredResource>, StorageError> {
        self.inner.read_history(id).await
    }

    async fn query_active(&self, resource_type: &str) -> Result<Vec<StoredResource>, StorageError> {
        self.inner.query_active(resource_type).await
    }

    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }
}

#[async_trait]
impl<S: ResourceWriter> ResourceWriter for EventedStorage<S> {
    async fn create(&self, resource: &Value) -> Result<StoredResource, StorageError> {
        let result = self.inner.create(resource).await?;
        self.emit(ChangeEvent::created(result.resource_id()));
        Ok(result)
    }

    async fn update(&self, resource: &Value) -> Result<StoredResource, StorageError> {
        let result = self.inner.update(resource).await?;
        self.emit(ChangeEvent::updated(result.resource_id()));
        Ok(result)
    }

    async fn delete(&self, resource_type: &str, id: &str) -> Result<(), StorageError> {
        self.inner.delete(resource_type, id).await?;
        self.emit(ChangeEvent::deleted(ResourceId::new(resource_type, id)));
        Ok(())
    }
}

impl<S> std::fmt::Debug for EventedStorage<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventedStorage")
            .field("broadcaster", &self.broadcaster)
            .finish_non_exhaustive()
    }
}
