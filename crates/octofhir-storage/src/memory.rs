//! In-memory versioned storage backend.
//!
//! Keeps every version of every resource so that [`ResourceReader::read_previous`]
//! can serve before-state lookups. Intended for embedding and tests; it has
//! no persistence and no search beyond `query_active`.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::error::StorageError;
use crate::traits::{ResourceReader, ResourceWriter};
use crate::types::StoredResource;
use octofhir_core::ResourceId;

type StorageKey = String; // Format: "ResourceType/id"

fn make_storage_key(resource_type: &str, id: &str) -> StorageKey {
    format!("{resource_type}/{id}")
}

#[derive(Debug, Default)]
struct ResourceEntry {
    /// All versions, oldest first.
    versions: Vec<StoredResource>,
    deleted: bool,
}

impl ResourceEntry {
    fn current(&self) -> Option<&StoredResource> {
        if self.deleted {
            None
        } else {
            self.versions.last()
        }
    }

    fn position(&self, version_id: &str) -> Option<usize> {
        self.versions.iter().position(|v| v.version_id == version_id)
    }

    /// Index of the newest version `id` refers to.
    fn end_of(&self, id: &ResourceId) -> Option<usize> {
        match &id.version_id {
            Some(v) => self.position(v),
            None => self.versions.len().checked_sub(1),
        }
    }

    fn next_version(&self) -> String {
        (self.versions.len() + 1).to_string()
    }
}

/// In-memory storage using a sharded concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    data: DashMap<StorageKey, ResourceEntry>,
}

impl InMemoryStorage {
    /// Creates a new empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live resources.
    pub fn len(&self) -> usize {
        self.data.iter().filter(|e| !e.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stamp `id` and `meta.versionId` into the stored body.
fn stamp(resource: &Value, id: &str, version_id: &str) -> Value {
    let mut body = resource.clone();
    if let Some(obj) = body.as_object_mut() {
        obj.insert("id".into(), Value::String(id.to_string()));
        let meta = obj
            .entry("meta")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert("versionId".into(), Value::String(version_id.to_string()));
        }
    }
    body
}

fn resource_type_of(resource: &Value) -> Result<&str, StorageError> {
    resource
        .get("resourceType")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| StorageError::invalid_resource("missing resourceType"))
}

#[async_trait]
impl ResourceReader for InMemoryStorage {
    async fn read(&self, id: &ResourceId) -> Result<StoredResource, StorageError> {
        let key = make_storage_key(&id.resource_type, &id.id);
        self.data
            .get(&key)
            .and_then(|entry| entry.current().cloned())
            .ok_or_else(|| StorageError::not_found(&id.resource_type, &id.id))
    }

    async fn read_version(
        &self,
        id: &ResourceId,
        version_id: &str,
    ) -> Result<Option<StoredResource>, StorageError> {
        let key = make_storage_key(&id.resource_type, &id.id);
        Ok(self
            .data
            .get(&key)
            .and_then(|entry| entry.position(version_id).map(|pos| entry.versions[pos].clone())))
    }

    async fn read_previous(&self, id: &ResourceId) -> Result<Option<StoredResource>, StorageError> {
        let key = make_storage_key(&id.resource_type, &id.id);
        let Some(entry) = self.data.get(&key) else {
            return Ok(None);
        };
        let Some(end) = entry.end_of(id) else {
            return Ok(None);
        };
        // A deleted resource's last stored version is the state before the delete.
        let before = if id.version_id.is_none() && entry.deleted {
            Some(end)
        } else {
            end.checked_sub(1)
        };
        Ok(before.map(|pos| entry.versions[pos].clone()))
    }

    async fn read_history(&self, id: &ResourceId) -> Result<Vec<StoredResource>, StorageError> {
        let key = make_storage_key(&id.resource_type, &id.id);
        let Some(entry) = self.data.get(&key) else {
            return Ok(Vec::new());
        };
        Ok(match entry.end_of(id) {
            Some(end) => entry.versions[..=end].to_vec(),
            None => Vec::new(),
        })
    }

    async fn query_active(&self, resource_type: &str) -> Result<Vec<StoredResource>, StorageError> {
        let mut active: Vec<StoredResource> = self
            .data
            .iter()
            .filter_map(|entry| entry.current().cloned())
            .filter(|r| r.resource_type == resource_type && r.status() == Some("active"))
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl ResourceWriter for InMemoryStorage {
    async fn create(&self, resource: &Value) -> Result<StoredResource, StorageError> {
        let resource_type = resource_type_of(resource)?;
        let id = resource
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let key = make_storage_key(resource_type, &id);
        let mut entry = self.data.entry(key).or_default();
        if entry.current().is_some() {
            return Err(StorageError::already_exists(resource_type, &id));
        }

        let version_id = entry.next_version();
        let stored = match entry.versions.last() {
            Some(prev) => prev.new_version(&version_id, stamp(resource, &id, &version_id)),
            None => StoredResource::new(
                &id,
                &version_id,
                resource_type,
                stamp(resource, &id, &version_id),
            ),
        };
        entry.versions.push(stored.clone());
        entry.deleted = false;

        debug!(resource_type = %resource_type, id = %id, version = %version_id, "Created resource");
        Ok(stored)
    }

    async fn update(&self, resource: &Value) -> Result<StoredResource, StorageError> {
        let resource_type = resource_type_of(resource)?;
        let id = resource
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| StorageError::invalid_resource("update requires an id"))?;

        let key = make_storage_key(resource_type, id);
        let mut entry = self
            .data
            .get_mut(&key)
            .filter(|e| !e.deleted)
            .ok_or_else(|| StorageError::not_found(resource_type, id))?;

        let version_id = entry.next_version();
        let stored = match entry.versions.last() {
            Some(prev) => prev.new_version(&version_id, stamp(resource, id, &version_id)),
            None => return Err(StorageError::internal("resource entry without versions")),
        };
        entry.versions.push(stored.clone());

        debug!(resource_type = %resource_type, id = %id, version = %version_id, "Updated resource");
        Ok(stored)
    }

    async fn delete(&self, resource_type: &str, id: &str) -> Result<(), StorageError> {
        let key = make_storage_key(resource_type, id);
        let mut entry = self
            .data
            .get_mut(&key)
            .filter(|e| !e.deleted)
            .ok_or_else(|| StorageError::not_found(resource_type, id))?;
        entry.deleted = true;

        debug!(resource_type = %resource_type, id = %id, "Deleted resource");
        Ok(())
    }
}
