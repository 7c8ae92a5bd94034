//! Sync conflict model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// How a conflict is (or will be) resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Re-push local content on top of the server's version
    KeepLocal,
    /// Adopt the server's content and version
    KeepRemote,
    /// Combine both sides with the entity's merge function, then re-push
    Merge,
    /// Leave the conflict open for a user decision
    #[default]
    Manual,
}

impl ResolutionStrategy {
    /// Column value stored in `SQLite`
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::KeepLocal => "keep_local",
            Self::KeepRemote => "keep_remote",
            Self::Merge => "merge",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "keep_local" => Ok(Self::KeepLocal),
            "keep_remote" => Ok(Self::KeepRemote),
            "merge" => Ok(Self::Merge),
            "manual" => Ok(Self::Manual),
            other => Err(Error::InvalidInput(format!(
                "unknown resolution strategy: {other}"
            ))),
        }
    }
}

/// Content of one side of a conflict at detection time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    /// Entity payload
    pub payload: Value,
    /// Tombstone timestamp (Unix ms)
    #[serde(default)]
    pub deleted_at: Option<i64>,
}

/// Recorded divergence between a local row and the server's copy.
///
/// Rows in `sync_conflicts` are append-only history: resolving one fills in
/// `resolved_at`, `resolution_strategy` and `resolved_by` but never deletes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    /// Entity type of the record
    pub entity_type: String,
    /// Local record involved in the conflict
    pub local_id: String,
    /// Server identifier, when the record had one
    pub server_id: Option<String>,
    /// Version the client held
    pub local_version: i64,
    /// Version the server holds
    pub server_version: i64,
    /// Local side at detection time
    pub local_data: RecordSnapshot,
    /// Server side at detection time
    pub server_data: RecordSnapshot,
    /// Detection timestamp (Unix ms)
    pub detected_at: i64,
    /// Resolution timestamp (Unix ms); `None` while open
    pub resolved_at: Option<i64>,
    /// Strategy applied, once resolved
    pub resolution_strategy: Option<ResolutionStrategy>,
    /// Who resolved it (`auto` or a user label)
    pub resolved_by: Option<String>,
}

impl SyncConflict {
    /// Whether the conflict still awaits resolution
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse_accepts_cli_spelling() {
        assert_eq!(
            "keep-local".parse::<ResolutionStrategy>().unwrap(),
            ResolutionStrategy::KeepLocal
        );
        assert_eq!(
            " KEEP_REMOTE ".parse::<ResolutionStrategy>().unwrap(),
            ResolutionStrategy::KeepRemote
        );
        assert!("newest".parse::<ResolutionStrategy>().is_err());
    }

    #[test]
    fn test_strategy_default_is_manual() {
        assert_eq!(ResolutionStrategy::default(), ResolutionStrategy::Manual);
    }
}
