//! Syncable record model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// Client-generated record identifier, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(Uuid);

impl LocalId {
    /// Create a new unique local ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LocalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Where a record stands relative to the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Carries local changes not yet accepted by the server
    Pending,
    /// Matches the last version agreed with the server
    Synced,
    /// Diverged from the server; an open `SyncConflict` describes both sides
    Conflict,
    /// Rejected by the server; retried on the next cycle
    Error,
}

impl SyncStatus {
    /// Column value stored in `SQLite`
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Conflict => "conflict",
            Self::Error => "error",
        }
    }

    /// Statuses selected by the push phase
    pub const fn is_pushable(self) -> bool {
        matches!(self, Self::Pending | Self::Error)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "conflict" => Ok(Self::Conflict),
            "error" => Ok(Self::Error),
            other => Err(Error::InvalidInput(format!("unknown sync status: {other}"))),
        }
    }
}

/// One business-entity row plus its sync metadata.
///
/// The payload is opaque to the sync engine; entity modules give it meaning
/// through [`crate::entity::SyncEntity`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableRecord {
    /// Stable local primary key
    pub local_id: LocalId,
    /// Identifier assigned by the remote store on first successful push
    pub server_id: Option<String>,
    /// Last version this client agreed on with the server (>= 1)
    pub version: i64,
    /// Current sync status
    pub sync_status: SyncStatus,
    /// Whether the row carries edits the server has not accepted yet
    pub modified_locally: bool,
    /// Last time the row matched the server (Unix ms)
    pub last_synced: Option<i64>,
    /// Tombstone timestamp (Unix ms)
    pub deleted_at: Option<i64>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last local write timestamp (Unix ms)
    pub updated_at: i64,
    /// Counter bumped on every local mutation
    pub local_revision: i64,
    /// Entity-specific fields
    pub payload: Value,
}

impl SyncableRecord {
    /// Whether the record has been tombstoned
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether the record has never reached the server
    #[must_use]
    pub const fn is_new(&self) -> bool {
        self.server_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_id_unique() {
        assert_ne!(LocalId::new(), LocalId::new());
    }

    #[test]
    fn test_local_id_parse() {
        let id = LocalId::new();
        let parsed: LocalId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_sync_status_round_trips_through_column_value() {
        for status in [
            SyncStatus::Pending,
            SyncStatus::Synced,
            SyncStatus::Conflict,
            SyncStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<SyncStatus>().unwrap(), status);
        }
        assert!("dirty".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn test_only_pending_and_error_are_pushable() {
        assert!(SyncStatus::Pending.is_pushable());
        assert!(SyncStatus::Error.is_pushable());
        assert!(!SyncStatus::Synced.is_pushable());
        assert!(!SyncStatus::Conflict.is_pushable());
    }
}
