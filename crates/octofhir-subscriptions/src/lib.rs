//! # octofhir-subscriptions
//!
//! Topic-based subscription matching and delivery.
//!
//! ## Flow
//!
//! ```text
//! ChangeEvent -> MatchingSubscriber -> PayloadBuilder -> MatchDeliverer -> Channel
//!                       ^
//!                 TopicRegistry <- TopicLoader <- TopicReloadService
//! ```
//!
//! - [`TopicRegistry`]: lock-free snapshot of the active topics
//! - [`TopicLoader`]: reads `SubscriptionTopic` resources and republishes the registry
//! - [`MatchingSubscriber`]: decides which topics a change concerns
//! - [`PayloadBuilder`]: shapes the notification per topic content level
//! - [`MatchDeliverer`]: publishes to every channel of a topic, wrapped in interceptors
//! - [`TopicPipeline`]: all of the above sharing one registry

pub mod channel;
pub mod deliverer;
pub mod error;
pub mod interceptor;
pub mod listener;
pub mod loader;
pub mod matcher;
pub mod parser;
pub mod payload;
pub mod pipeline;
pub mod registry;
pub mod reload;
pub mod subscriber;
pub mod types;

pub use channel::{Ack, Channel, ChannelId, ChannelRegistry, QueueChannel};
pub use deliverer::{DeliveryOutcome, DeliveryReport, DestinationResult, MatchDeliverer};
pub use error::{ChannelError, EvaluationError, LoadError, TopicParseError};
pub use interceptor::{
    DeliveryInterceptor, HookDecision, InterceptorBroadcaster, ReloadInterceptor, Veto,
};
pub use listener::{MatchingStats, TopicMatchingListener};
pub use loader::{ReloadReport, SkippedTopic, TopicLoader};
pub use matcher::{BoundedMatcher, CriteriaMatcher, DynMatcher};
pub use parser::parse_topic;
pub use payload::PayloadBuilder;
pub use pipeline::{PipelineOptions, TopicPipeline};
pub use registry::{TopicRegistry, TopicSnapshot};
pub use reload::{
    ReloadConfig, ReloadStats, TopicChange, TopicChangeListener, TopicChangeNotifier,
    TopicReloadService,
};
pub use subscriber::{MatchedChange, MatchingOptions, MatchingSubscriber};
pub use types::*;
