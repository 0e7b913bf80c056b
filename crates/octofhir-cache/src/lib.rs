//! # octofhir-cache
//!
//! Keeps caches of data derived from resources consistent with storage.
//!
//! - [`InvalidationListener`]: a change listener that removes the derived
//!   keys a change affects, or clears the cache when they cannot be resolved
//! - [`NameVersionedResolver`]: derives keys from a resource's `name` and
//!   `version` via the [`NameVersioned`] capability
//! - [`LibraryCache`]: compiled CQL libraries by [`VersionedIdentifier`]
//!
//! ```ignore
//! let cache = Arc::new(LibraryCache::default());
//! let listener = library_invalidation_listener(storage.clone(), cache.clone(), Duration::from_secs(5));
//! listeners.register(Arc::new(listener)).await;
//! ```

pub mod error;
pub mod identity;
pub mod invalidation;
pub mod library;

pub use error::ResolveError;
pub use identity::{DEFAULT_RESOLVE_TIMEOUT, NameVersioned, NameVersionedResolver, VersionedIdentifier};
pub use invalidation::{DerivedKeyResolver, InvalidatableCache, InvalidationListener, InvalidationStats};
pub use library::{
    CacheStats, CompiledLibrary, ContentError, LibraryCache,
    LibraryInvalidationListener, LibraryResource, library_invalidation_listener,
};
