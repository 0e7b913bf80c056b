//! Change listener that keeps a derived cache consistent with storage.
//!
//! A derived cache is keyed by something computed from resource content
//! (a library's name and version, for instance) rather than by storage
//! identity. When a resource changes the listener asks a
//! [`DerivedKeyResolver`] which keys are affected and removes exactly those.
//! If the keys cannot be determined, the whole cache is cleared: a clear only
//! costs recomputation, a missed removal serves stale data.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use octofhir_core::events::{ListenerError, ResourceChangeListener};
use octofhir_core::{ChangeEvent, ChangeKind, ResourceId};
use tracing::{debug, info, warn};

use crate::error::ResolveError;

// =============================================================================
// Boundaries
// =============================================================================

/// The two mutations an invalidation listener needs from a cache.
pub trait InvalidatableCache<K>: Send + Sync {
    /// Remove `key`, returning whether an entry was present.
    fn remove_if_present(&self, key: &K) -> bool;

    /// Remove every entry.
    fn clear(&self);
}

/// Computes the derived keys a change to one resource invalidates.
#[async_trait]
pub trait DerivedKeyResolver: Send + Sync {
    type Key: Send + Sync;

    /// The only resource type this resolver understands.
    fn resource_type(&self) -> &'static str;

    /// Keys to remove for `id` changed by `kind`.
    ///
    /// An empty result means nothing cached can depend on the change.
    async fn resolve(&self, id: &ResourceId, kind: ChangeKind)
    -> Result<Vec<Self::Key>, ResolveError>;
}

// =============================================================================
// Listener
// =============================================================================

/// Counters of an [`InvalidationListener`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationStats {
    pub targeted_removals: u64,
    pub full_clears: u64,
    pub resolve_failures: u64,
}

pub struct InvalidationListener<R, C> {
    name: String,
    resource_types: [&'static str; 1],
    resolver: R,
    cache: Arc<C>,

    targeted_removals: AtomicU64,
    full_clears: AtomicU64,
    resolve_failures: AtomicU64,
}

impl<R, C> InvalidationListener<R, C>
where
    R: DerivedKeyResolver,
    C: InvalidatableCache<R::Key>,
{
    pub fn new(name: impl Into<String>, resolver: R, cache: Arc<C>) -> Self {
        let resource_types = [resolver.resource_type()];
        Self {
            name: name.into(),
            resource_types,
            resolver,
            cache,
            targeted_removals: AtomicU64::new(0),
            full_clears: AtomicU64::new(0),
            resolve_failures: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }

    pub fn stats(&self) -> InvalidationStats {
        InvalidationStats {
            targeted_removals: self.targeted_removals.load(Ordering::Relaxed),
            full_clears: self.full_clears.load(Ordering::Relaxed),
            resolve_failures: self.resolve_failures.load(Ordering::Relaxed),
        }
    }

    /// Invalidate everything `event` may have made stale.
    ///
    /// Deleted ids are handled before updated ones. Created ids and ids of
    /// other resource types are ignored. Processing continues after a clear
    /// so the counters reflect every id in the event.
    pub async fn invalidate(&self, event: &ChangeEvent) {
        let ids = event
            .deleted_ids()
            .iter()
            .map(|id| (ChangeKind::Deleted, id))
            .chain(event.updated_ids().iter().map(|id| (ChangeKind::Updated, id)));

        for (kind, id) in ids {
            if id.resource_type != self.resolver.resource_type() {
                continue;
            }

            match self.resolver.resolve(id, kind).await {
                Ok(keys) => {
                    for key in &keys {
                        if self.cache.remove_if_present(key) {
                            self.targeted_removals.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    debug!(listener = %self.name, resource = %id, kind = %kind, keys = keys.len(), "Removed derived cache keys");
                }
                Err(e) => {
                    self.resolve_failures.fetch_add(1, Ordering::Relaxed);
                    debug!(listener = %self.name, resource = %id, kind = %kind, error = %e, "Cannot resolve cache keys, clearing cache");
                    self.clear();
                }
            }
        }
    }

    fn clear(&self) {
        self.cache.clear();
        self.full_clears.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl<R, C> ResourceChangeListener for InvalidationListener<R, C>
where
    R: DerivedKeyResolver,
    C: InvalidatableCache<R::Key> + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn resource_types(&self) -> &[&str] {
        &self.resource_types
    }

    async fn handle_change(&self, event: &ChangeEvent) -> Result<(), ListenerError> {
        self.invalidate(event).await;
        Ok(())
    }

    async fn on_events_missed(&self, missed: u64) -> Result<(), ListenerError> {
        warn!(listener = %self.name, missed, "Change events missed, clearing cache");
        self.clear();
        Ok(())
    }

    async fn on_shutdown(&self) -> Result<(), ListenerError> {
        info!(listener = %self.name, stats = ?self.stats(), "Invalidation listener stopped");
        Ok(())
    }
}

impl<R, C> std::fmt::Debug for InvalidationListener<R, C>
where
    R: DerivedKeyResolver,
    C: InvalidatableCache<R::Key>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationListener")
            .field("name", &self.name)
            .field("resource_type", &self.resolver.resource_type())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
