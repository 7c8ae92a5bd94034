//! Data models for Tandem

mod metadata;
mod record;
mod sync_conflict;

pub use metadata::{SyncCounts, SyncMetadata, GLOBAL_METADATA_KEY};
pub use record::{LocalId, SyncStatus, SyncableRecord};
pub use sync_conflict::{RecordSnapshot, ResolutionStrategy, SyncConflict};
