//! Hot-swappable registry of active subscription topics.
//!
//! The registry holds one [`TopicSnapshot`] behind an `ArcSwap`. Readers take
//! the current generation lock-free with [`TopicRegistry::snapshot`]; the
//! topic loader replaces it wholesale with [`TopicRegistry::publish`]. A
//! snapshot is never mutated after publication, so a reader holding one keeps
//! a consistent view no matter how many generations are published meanwhile.
//!
//! # Usage
//!
//! ```ignore
//! let registry = TopicRegistry::new();
//!
//! // Topic loader
//! registry.publish(parsed_topics);
//!
//! // Matching subscriber, once per change event
//! let snapshot = registry.snapshot();
//! for topic in snapshot.topics_for_type("Patient") {
//!     // ...
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use crate::types::TopicDefinition;

/// One immutable generation of the topic table.
#[derive(Debug, Default)]
pub struct TopicSnapshot {
    generation: u64,
    /// Topics in load order.
    topics: Vec<Arc<TopicDefinition>>,
    /// resource type -> positions in `topics`
    type_index: HashMap<String, Vec<usize>>,
}

impl TopicSnapshot {
    fn build(generation: u64, topics: Vec<TopicDefinition>) -> Self {
        let topics: Vec<Arc<TopicDefinition>> = topics.into_iter().map(Arc::new).collect();

        let mut type_index: HashMap<String, Vec<usize>> = HashMap::new();
        for (pos, topic) in topics.iter().enumerate() {
            for trigger in &topic.resource_triggers {
                let slots = type_index.entry(trigger.resource_type.clone()).or_default();
                if slots.last() != Some(&pos) {
                    slots.push(pos);
                }
            }
        }

        Self {
            generation,
            topics,
            type_index,
        }
    }

    /// Generation number; 0 is the empty snapshot present at start-up.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// All topics, in the order they were published.
    pub fn topics(&self) -> &[Arc<TopicDefinition>] {
        &self.topics
    }

    /// Topics with at least one trigger on `resource_type`, in publish order.
    pub fn topics_for_type<'a>(
        &'a self,
        resource_type: &str,
    ) -> impl Iterator<Item = &'a Arc<TopicDefinition>> {
        self.type_index
            .get(resource_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|&pos| &self.topics[pos])
    }

    /// Whether any topic triggers on `resource_type`.
    pub fn has_triggers_for(&self, resource_type: &str) -> bool {
        self.type_index.contains_key(resource_type)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<TopicDefinition>> {
        self.topics.iter().find(|t| t.id == id)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

/// Process-wide topic table with atomic snapshot replacement.
#[derive(Clone)]
pub struct TopicRegistry {
    /// Current snapshot with atomic pointer swap (lock-free reads)
    inner: Arc<ArcSwap<TopicSnapshot>>,
}

impl TopicRegistry {
    /// Create a registry holding the empty generation-0 snapshot.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(TopicSnapshot::default())),
        }
    }

    /// Current snapshot. Never blocks.
    pub fn snapshot(&self) -> Arc<TopicSnapshot> {
        self.inner.load_full()
    }

    /// Replace the whole table with `topics` and return the new generation.
    ///
    /// Called by the topic loader, which serialises reloads so there is a
    /// single writer.
    pub fn publish(&self, topics: Vec<TopicDefinition>) -> u64 {
        let generation = self.inner.load().generation + 1;
        let count = topics.len();
        self.inner
            .store(Arc::new(TopicSnapshot::build(generation, topics)));
        info!(generation, topics = count, "Published topic snapshot");
        generation
    }
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TopicRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.inner.load();
        f.debug_struct("TopicRegistry")
            .field("generation", &snapshot.generation)
            .field("topics", &snapshot.topics.len())
            .finish()
    }
}
