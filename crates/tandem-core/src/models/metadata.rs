//! Per-entity sync bookkeeping

use serde::{Deserialize, Serialize};

/// Metadata key for failures that are not tied to one entity type
pub const GLOBAL_METADATA_KEY: &str = "*";

/// One row of `sync_metadata`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// Entity type, or [`GLOBAL_METADATA_KEY`]
    pub entity_type: String,
    /// Pull watermark, always a server-issued timestamp (Unix ms)
    pub last_pull_timestamp: Option<i64>,
    /// Last completed push (server timestamp, Unix ms)
    pub last_push_timestamp: Option<i64>,
    /// Errors recorded since the row was created
    pub sync_errors_count: i64,
    /// Most recent error message
    pub last_error_message: Option<String>,
}

/// Row counts by sync status for one entity type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub pending: u64,
    pub synced: u64,
    pub conflict: u64,
    pub error: u64,
    /// Conflicts still awaiting resolution
    pub open_conflicts: u64,
}

impl SyncCounts {
    /// Rows that still need attention before the store matches the server
    pub const fn outstanding(&self) -> u64 {
        self.pending + self.conflict + self.error
    }
}
