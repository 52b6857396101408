//! Metrics data model and the source abstraction.

mod source;
mod types;

pub use source::{CollectError, SharedSource, SnapshotSource};
pub use types::*;
