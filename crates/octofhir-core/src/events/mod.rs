//! Resource change events and listener infrastructure.
//!
//! Storage writers describe each committed batch of mutations as a
//! [`ChangeEvent`] and publish it on the [`ChangeEventBroadcaster`]. The
//! [`ListenerDispatcher`] forwards every event to the [`ListenerRegistry`],
//! which runs each interested [`ResourceChangeListener`] in its own task.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                    ChangeEventBroadcaster                            │
//! │              (tokio::sync::broadcast channel)                        │
//! └─────────────────────────────────────────────────────────────────────┘
//!                               │
//!                    ListenerDispatcher::run
//!                               │
//!          ┌────────────────────┼────────────────────┐
//!          ▼                    ▼                    ▼
//!    ┌────────────┐      ┌────────────┐      ┌────────────┐
//!    │  topics    │      │   cache    │      │  reload    │
//!    │  matching  │      │ invalidate │      │  trigger   │
//!    └────────────┘      └────────────┘      └────────────┘
//! ```
//!
//! # Module Structure
//!
//! - [`types`]: `ResourceId`, `ChangeKind`, `ChangeEvent`
//! - [`broadcaster`]: event bus
//! - [`listener`]: listener trait and error type
//! - [`registry`]: listener registry, isolation helpers and dispatcher

pub mod broadcaster;
pub mod listener;
pub mod registry;
pub mod types;

pub use broadcaster::ChangeEventBroadcaster;
pub use listener::{ListenerError, ResourceChangeListener};
pub use registry::{
    Isolated, ListenerDispatcher, ListenerOutcome, ListenerRegistry, ListenerReport,
    panic_message, run_isolated,
};
pub use types::{ChangeEvent, ChangeEventBuilder, ChangeKind, ResourceId};
