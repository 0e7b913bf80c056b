//! Building notification payloads from match results.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::types::{MatchResult, NotificationPayload, NotificationShape, PayloadContent};

/// Turns a [`MatchResult`] into the payload its topic's shape asks for.
///
/// Pure: no I/O, no clock. The same inputs always build an equal payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadBuilder;

impl PayloadBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build the payload for `result`.
    ///
    /// `body` is the post-change resource when it was read during matching.
    /// Returns `None` for a full-resource topic whose body is unavailable,
    /// which is always the case for deletes.
    pub fn build(&self, result: &MatchResult, body: Option<Arc<Value>>) -> Option<NotificationPayload> {
        let focus = || Some(result.resource_id.versioned_reference());

        let (content, focus_reference) = match result.shape {
            NotificationShape::FullResource => match body {
                Some(body) => (PayloadContent::Resource(body), focus()),
                None => {
                    warn!(
                        topic_id = %result.topic_id,
                        resource = %result.resource_id,
                        interaction = %result.interaction,
                        "Full-resource notification skipped: resource body unavailable"
                    );
                    return None;
                }
            },
            NotificationShape::IdOnly => (
                PayloadContent::ResourceId(result.resource_id.clone()),
                focus(),
            ),
            NotificationShape::Empty => (PayloadContent::Empty, None),
        };

        Some(NotificationPayload {
            topic_id: result.topic_id.clone(),
            topic_url: result.topic_url.clone(),
            interaction: result.interaction,
            content,
            focus_reference,
        })
    }
}
