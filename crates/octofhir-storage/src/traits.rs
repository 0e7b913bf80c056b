//! Storage traits consumed by the change notification pipeline.
//!
//! The pipeline only ever reads: listeners fetch the state a change left
//! behind and the topic loader queries active topic definitions. Writes go
//! through [`ResourceWriter`], whose evented wrapper produces the change
//! events in the first place.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageError;
use crate::types::StoredResource;
use octofhir_core::ResourceId;

/// Read access to stored resources.
///
/// # Example
///
/// ```ignore
/// use octofhir_storage::{ResourceReader, StorageError, StoredResource};
///
/// async fn load_topics(reader: &dyn ResourceReader) -> Result<Vec<StoredResource>, StorageError> {
///     reader.query_active("SubscriptionTopic").await
/// }
/// ```
#[async_trait]
pub trait ResourceReader: Send + Sync {
    /// Reads the current version of a resource.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the resource doesn't exist or was
    /// deleted.
    async fn read(&self, id: &ResourceId) -> Result<StoredResource, StorageError>;

    /// Reads one stored version of a resource, deleted or not.
    ///
    /// Returns `Ok(None)` when the version is unknown or the backend does not
    /// keep history.
    async fn read_version(
        &self,
        _id: &ResourceId,
        _version_id: &str,
    ) -> Result<Option<StoredResource>, StorageError> {
        Ok(None)
    }

    /// Reads the version that preceded `id.version_id`. Without a version on
    /// `id`, reads the version that preceded the current state.
    ///
    /// Returns `Ok(None)` when there is no earlier version or the backend does
    /// not keep history.
    async fn read_previous(&self, _id: &ResourceId) -> Result<Option<StoredResource>, StorageError> {
        Ok(None)
    }

    /// Every stored version up to and including `id.version_id`, oldest
    /// first. Without a version on `id`, every stored version.
    ///
    /// Returns an empty list when the version is unknown or the backend does
    /// not keep history.
    async fn read_history(&self, _id: &ResourceId) -> Result<Vec<StoredResource>, StorageError> {
        Ok(Vec::new())
    }

    /// Returns every live resource of `resource_type` whose `status` is `active`.
    async fn query_active(&self, resource_type: &str) -> Result<Vec<StoredResource>, StorageError>;

    /// Returns the name of this storage backend.
    fn backend_name(&self) -> &'static str;
}

/// Write access to stored resources.
#[async_trait]
pub trait ResourceWriter: Send + Sync {
    /// Creates a new resource. The `id` is taken from the body or generated.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::AlreadyExists` if a live resource with the same
    /// id exists, `StorageError::InvalidResource` if `resourceType` is missing.
    async fn create(&self, resource: &Value) -> Result<StoredResource, StorageError>;

    /// Replaces the current version of an existing resource.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if there is no live resource to update.
    async fn update(&self, resource: &Value) -> Result<StoredResource, StorageError>;

    /// Deletes a resource.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if there is no live resource to delete.
    async fn delete(&self, resource_type: &str, id: &str) -> Result<(), StorageError>;
}

/// Shared handle to a reader.
pub type DynReader = Arc<dyn ResourceReader>;

