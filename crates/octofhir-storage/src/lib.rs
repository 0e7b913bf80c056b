//! # octofhir-storage
//!
//! Storage boundary for the change notification pipeline.
//!
//! ## Overview
//!
//! - [`ResourceReader`]: what listeners and the topic loader consume
//!   (`read`, the version-pinned history reads, `query_active`)
//! - [`ResourceWriter`]: create, update and delete
//! - [`EventedStorage`]: wraps a writer and publishes a
//!   [`ChangeEvent`](octofhir_core::ChangeEvent) after every successful write
//! - [`InMemoryStorage`]: versioned in-memory backend
//!
//! ## Example
//!
//! ```ignore
//! use octofhir_storage::{ResourceReader, StorageError};
//! use octofhir_core::ResourceId;
//!
//! async fn library_name(reader: &dyn ResourceReader, id: &str) -> Result<Option<String>, StorageError> {
//!     let stored = reader.read(&ResourceId::new("Library", id)).await?;
//!     Ok(stored.resource["name"].as_str().map(str::to_string))
//! }
//! ```

mod error;
pub mod evented;
pub mod memory;
mod traits;
mod types;

pub use error::{ErrorCategory, StorageError};
pub use evented::{EventedStorage, WriteOp};
pub use memory::InMemoryStorage;
pub use traits::{DynReader, ResourceReader, ResourceWriter};
pub use types::StoredResource;
