pub mod error;
pub mod events;

pub use error::{CoreError, Result};
pub use events::{ChangeEvent, ChangeKind, ResourceId};
