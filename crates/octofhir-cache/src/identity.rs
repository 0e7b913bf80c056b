//! Name and version identity of knowledge artifacts.

use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use octofhir_core::{ChangeKind, ResourceId};
use octofhir_storage::{DynReader, StorageError, StoredResource};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ResolveError;
use crate::invalidation::DerivedKeyResolver;

/// Default bound on each storage read made while resolving keys.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Cache identity of a name-versioned artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionedIdentifier {
    pub name: String,
    pub version: Option<String>,
}

impl VersionedIdentifier {
    pub fn new(name: impl Into<String>, version: Option<impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            version: version.map(Into::into),
        }
    }
}

impl fmt::Display for VersionedIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}|{}", self.name, v),
            None => f.write_str(&self.name),
        }
    }
}

/// A resource kind whose cache identity is its `name` and `version`.
pub trait NameVersioned: Sized + Send + Sync {
    const RESOURCE_TYPE: &'static str;

    fn name(&self) -> &str;

    fn version(&self) -> Option<&str>;

    /// Extract the identity from a resource body.
    fn from_resource(resource: &Value) -> Result<Self, ResolveError>;

    fn versioned_identifier(&self) -> VersionedIdentifier {
        VersionedIdentifier::new(self.name(), self.version())
    }
}

/// Resolves changes to `T` resources into [`VersionedIdentifier`]s.
///
/// Resolution is pinned to the version the event carries, not to whatever
/// storage holds when the event is handled, so batched, lagged and reordered
/// events still remove every identity they made stale.
///
/// - update: the identifiers of every stored version up to and including the
///   event's version. A folded batch names only its last version, so the
///   versions before it must be covered too.
/// - delete: always an error, which falls back to a full clear. A failed
///   read means the identity is gone; a successful read means the resource
///   was re-created and the read shows the wrong content.
/// - create: nothing
pub struct NameVersionedResolver<T> {
    reader: DynReader,
    timeout: Duration,
    _marker: PhantomData<fn() -> T>,
}

impl<T: NameVersioned + 'static> NameVersionedResolver<T> {
    pub fn new(reader: DynReader) -> Self {
        Self::with_timeout(reader, DEFAULT_RESOLVE_TIMEOUT)
    }

    pub fn with_timeout(reader: DynReader, timeout: Duration) -> Self {
        Self {
            reader,
            timeout,
            _marker: PhantomData,
        }
    }

    async fn bounded<F, O>(&self, read: F) -> Result<O, ResolveError>
    where
        F: Future<Output = Result<O, StorageError>>,
    {
        tokio::time::timeout(self.timeout, read)
            .await
            .map_err(|_| ResolveError::Timeout(self.timeout))?
            .map_err(ResolveError::from)
    }

    fn identify(stored: &StoredResource) -> Result<VersionedIdentifier, ResolveError> {
        if stored.resource_type != T::RESOURCE_TYPE {
            return Err(ResolveError::unexpected_type(
                T::RESOURCE_TYPE,
                &stored.resource_type,
            ));
        }
        Ok(T::from_resource(&stored.resource)?.versioned_identifier())
    }
}

#[async_trait]
impl<T: NameVersioned + 'static> DerivedKeyResolver for NameVersionedResolver<T> {
    type Key = VersionedIdentifier;

    fn resource_type(&self) -> &'static str {
        T::RESOURCE_TYPE
    }

    async fn resolve(
        &self,
        id: &ResourceId,
        kind: ChangeKind,
    ) -> Result<Vec<VersionedIdentifier>, ResolveError> {
        match kind {
            ChangeKind::Created => Ok(Vec::new()),
            ChangeKind::Deleted => match self.bounded(self.reader.read(id)).await {
                Ok(_) => Err(ResolveError::Recreated(id.reference())),
                Err(e) => Err(e),
            },
            ChangeKind::Updated => {
                let history = self.bounded(self.reader.read_history(id)).await?;
                let Some(last) = history.last() else {
                    return Err(ResolveError::MissingHistory(id.versioned_reference()));
                };
                if id.version_id.as_ref().is_some_and(|v| *v != last.version_id) {
                    return Err(ResolveError::MissingHistory(id.versioned_reference()));
                }
                if history.len() < 2 {
                    return Err(ResolveError::MissingPrior(id.versioned_reference()));
                }

                let mut keys = Vec::with_capacity(history.len());
                for stored in &history {
                    let key = Self::identify(stored)?;
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
                Ok(keys)
            }
        }
    }
}

impl<T> fmt::Debug for NameVersionedResolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NameVersionedResolver")
            .field("backend", &self.reader.backend_name())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::LibraryResource;
    use octofhir_storage::{InMemoryStorage, ResourceWriter};
    use serde_json::json;
    use std::sync::Arc;

    fn library(id: &str, name: &str, version: &str) -> Value {
        json!({"resourceType": "Library", "id": id, "name": name, "version": version})
    }

    fn resolver(storage: &Arc<InMemoryStorage>) -> NameVersionedResolver<LibraryResource> {
        NameVersionedResolver::new(storage.clone())
    }

    #[test]
    fn test_identifier_display() {
        assert_eq!(VersionedIdentifier::new("Foo", Some("1")).to_string(), "Foo|1");
        assert_eq!(VersionedIdentifier::new("Foo", None::<String>).to_string(), "Foo");
    }

    #[tokio::test]
    async fn test_update_resolves_prior_and_current() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.create(&library("lib-1", "Foo", "1")).await.unwrap();
        storage.update(&library("lib-1", "Foo", "2")).await.unwrap();

        let keys = resolver(&storage)
            .resolve(&ResourceId::new("Library", "lib-1"), ChangeKind::Updated)
            .await
            .unwrap();
        assert_eq!(
            keys,
            vec![
                VersionedIdentifier::new("Foo", Some("1")),
                VersionedIdentifier::new("Foo", Some("2")),
            ]
        );
    }

    #[tokio::test]
    async fn test_unchanged_identity_resolves_once() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.create(&library("lib-1", "Foo", "1")).await.unwrap();
        storage.update(&library("lib-1", "Foo", "1")).await.unwrap();

        let keys = resolver(&storage)
            .resolve(&ResourceId::new("Library", "lib-1"), ChangeKind::Updated)
            .await
            .unwrap();
        assert_eq!(keys, vec![VersionedIdentifier::new("Foo", Some("1"))]);
    }

    #[tokio::test]
    async fn test_delete_fails_to_resolve() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.create(&library("lib-1", "Foo", "1")).await.unwrap();
        storage.delete("Library", "lib-1").await.unwrap();

        let err = resolver(&storage)
            .resolve(&ResourceId::new("Library", "lib-1"), ChangeKind::Deleted)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_without_history_is_missing_prior() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.create(&library("lib-1", "Foo", "1")).await.unwrap();

        let err = resolver(&storage)
            .resolve(&ResourceId::new("Library", "lib-1"), ChangeKind::Updated)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::MissingPrior(_)));
    }

    #[tokio::test]
    async fn test_update_covers_every_version_up_to_the_event() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.create(&library("lib-1", "Foo", "1")).await.unwrap();
        let v2 = storage.update(&library("lib-1", "Foo", "2")).await.unwrap();
        let v3 = storage.update(&library("lib-1", "Foo", "3")).await.unwrap();
        storage.update(&library("lib-1", "Foo", "4")).await.unwrap();

        let keys = resolver(&storage)
            .resolve(&v3.resource_id(), ChangeKind::Updated)
            .await
            .unwrap();
        assert_eq!(
            keys,
            vec![
                VersionedIdentifier::new("Foo", Some("1")),
                VersionedIdentifier::new("Foo", Some("2")),
                VersionedIdentifier::new("Foo", Some("3")),
            ]
        );

        // An older event handled late still names its own versions
        let keys = resolver(&storage)
            .resolve(&v2.resource_id(), ChangeKind::Updated)
            .await
            .unwrap();
        assert_eq!(keys.len(), 2);
        assert!(!keys.contains(&VersionedIdentifier::new("Foo", Some("4"))));
    }

    #[tokio::test]
    async fn test_unknown_event_version_is_missing_history() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.create(&library("lib-1", "Foo", "1")).await.unwrap();
        storage.update(&library("lib-1", "Foo", "2")).await.unwrap();

        let id = ResourceId::new("Library", "lib-1").with_version("7");
        let err = resolver(&storage)
            .resolve(&id, ChangeKind::Updated)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::MissingHistory(_)));
    }

    #[tokio::test]
    async fn test_delete_handled_after_recreate_fails_to_resolve() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.create(&library("lib-1", "Foo", "1")).await.unwrap();
        storage.delete("Library", "lib-1").await.unwrap();
        storage.create(&library("lib-1", "Bar", "1")).await.unwrap();

        let err = resolver(&storage)
            .resolve(&ResourceId::new("Library", "lib-1"), ChangeKind::Deleted)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Recreated(_)));
    }

    #[tokio::test]
    async fn test_create_resolves_nothing() {
        let storage = Arc::new(InMemoryStorage::new());
        let keys = resolver(&storage)
            .resolve(&ResourceId::new("Library", "new"), ChangeKind::Created)
            .await
            .unwrap();
        assert!(keys.is_empty());
    }
}
