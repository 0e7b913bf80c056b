//! Compiled library cache keyed by library name and version.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use dashmap::DashMap;
use octofhir_storage::DynReader;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::ResolveError;
use crate::identity::{NameVersioned, NameVersionedResolver, VersionedIdentifier};
use crate::invalidation::{InvalidatableCache, InvalidationListener};

/// Name of the listener returned by [`library_invalidation_listener`].
pub const LIBRARY_INVALIDATION_LISTENER: &str = "library_cache_invalidation";

// =============================================================================
// Library resource
// =============================================================================

/// Identity and content of a FHIR `Library` resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryResource {
    pub id: Option<String>,
    pub url: Option<String>,
    pub name: String,
    pub version: Option<String>,
}

impl NameVersioned for LibraryResource {
    const RESOURCE_TYPE: &'static str = "Library";

    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    fn from_resource(resource: &Value) -> Result<Self, ResolveError> {
        let resource_type = resource
            .get("resourceType")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if resource_type != Self::RESOURCE_TYPE {
            return Err(ResolveError::unexpected_type(Self::RESOURCE_TYPE, resource_type));
        }

        let text = |field: &str| resource.get(field).and_then(Value::as_str).map(str::to_string);
        let name = text("name").ok_or_else(|| ResolveError::invalid_resource("Library has no name"))?;

        Ok(Self {
            id: text("id"),
            url: text("url"),
            name,
            version: text("version"),
        })
    }
}

/// Errors extracting CQL source from a `Library`.
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("Library has no text/cql content")]
    Missing,

    #[error("CQL content has no data")]
    NoData,

    #[error("failed to decode base64 CQL content: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("CQL content is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl LibraryResource {
    /// Decode the first `text/cql` attachment of a `Library` body.
    pub fn cql_source(resource: &Value) -> Result<String, ContentError> {
        let content = resource
            .get("content")
            .and_then(Value::as_array)
            .ok_or(ContentError::Missing)?;

        let attachment = content
            .iter()
            .find(|c| {
                matches!(
                    c.get("contentType").and_then(Value::as_str),
                    Some("text/cql" | "text/cql-expression")
                )
            })
            .ok_or(ContentError::Missing)?;

        let data = attachment
            .get("data")
            .and_then(Value::as_str)
            .ok_or(ContentError::NoData)?;
        let bytes = base64::engine::general_purpose::STANDARD.decode(data)?;
        Ok(String::from_utf8(bytes)?)
    }
}

// =============================================================================
// Cache
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledLibrary {
    pub identifier: VersionedIdentifier,
    pub url: Option<String>,
    /// ELM JSON
    pub elm: Value,
    pub cql_source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
}

/// Compiled libraries by [`VersionedIdentifier`].
///
/// Entries leave only through [`InvalidatableCache`], when the backing
/// `Library` changes. There is no eviction: an entry that outlived its
/// library would be indistinguishable from a current one.
#[derive(Default)]
pub struct LibraryCache {
    compiled: DashMap<VersionedIdentifier, Arc<CompiledLibrary>>,
}

impl LibraryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identifier: &VersionedIdentifier) -> Option<Arc<CompiledLibrary>> {
        self.compiled.get(identifier).map(|entry| entry.clone())
    }

    pub fn contains(&self, identifier: &VersionedIdentifier) -> bool {
        self.compiled.contains_key(identifier)
    }

    pub fn insert(&self, library: Arc<CompiledLibrary>) {
        self.compiled.insert(library.identifier.clone(), library);
    }

    /// Return the cached library or compile and cache it.
    ///
    /// Compilation runs outside any map lock, so two callers missing at the
    /// same time may both compile; the later insert wins.
    pub async fn get_or_compile<F, Fut, E>(
        &self,
        identifier: &VersionedIdentifier,
        compile: F,
    ) -> Result<Arc<CompiledLibrary>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CompiledLibrary, E>>,
    {
        if let Some(hit) = self.get(identifier) {
            return Ok(hit);
        }

        let compiled = Arc::new(compile().await?);
        self.insert(compiled.clone());
        debug!(library = %identifier, "Compiled and cached library");
        Ok(compiled)
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }

    pub fn identifiers(&self) -> Vec<VersionedIdentifier> {
        self.compiled.iter().map(|e| e.key().clone()).collect()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.compiled.len(),
        }
    }
}

impl InvalidatableCache<VersionedIdentifier> for LibraryCache {
    fn remove_if_present(&self, key: &VersionedIdentifier) -> bool {
        self.compiled.remove(key).is_some()
    }

    fn clear(&self) {
        let dropped = self.compiled.len();
        self.compiled.clear();
        info!(dropped, "Library cache cleared");
    }
}

impl std::fmt::Debug for LibraryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryCache")
            .field("stats", &self.stats())
            .finish()
    }
}

pub type LibraryInvalidationListener =
    InvalidationListener<NameVersionedResolver<LibraryResource>, LibraryCache>;

/// Listener removing compiled libraries whose `Library` resource changed.
pub fn library_invalidation_listener(
    reader: DynReader,
    cache: Arc<LibraryCache>,
    resolve_timeout: Duration,
) -> LibraryInvalidationListener {
    InvalidationListener::new(
        LIBRARY_INVALIDATION_LISTENER,
        NameVersionedResolver::with_timeout(reader, resolve_timeout),
        cache,
    )
}
