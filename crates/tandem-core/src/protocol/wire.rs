//! JSON bodies of the Remote Sync API and the notification channel

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::RecordSnapshot;

/// One record sent by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushItem {
    /// Client row id, used for correlation and create idempotency
    pub local_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Last version the client agreed on with the server
    pub version: i64,
    pub payload: Value,
    #[serde(default)]
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkSyncRequest {
    pub items: Vec<PushItem>,
}

/// The server's copy of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub server_id: String,
    /// `local_id` of the client that created the record
    #[serde(default)]
    pub local_id: Option<String>,
    pub version: i64,
    pub payload: Value,
    #[serde(default)]
    pub deleted_at: Option<i64>,
    /// Server clock tick of the last accepted write
    pub updated_at: i64,
}

impl RemoteItem {
    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            payload: self.payload.clone(),
            deleted_at: self.deleted_at,
        }
    }
}

/// Outcome of one pushed item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemResult {
    Success {
        local_id: String,
        server_id: String,
        version: i64,
    },
    Conflict {
        local_id: String,
        server_version: i64,
        server_data: RemoteItem,
    },
    Error {
        local_id: String,
        error: String,
    },
}

impl ItemResult {
    pub fn local_id(&self) -> &str {
        match self {
            Self::Success { local_id, .. }
            | Self::Conflict { local_id, .. }
            | Self::Error { local_id, .. } => local_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkSyncResponse {
    pub results: Vec<ItemResult>,
    pub success_count: usize,
    pub conflict_count: usize,
    pub error_count: usize,
    pub server_timestamp: i64,
}

impl BulkSyncResponse {
    /// Build a response and its aggregate counts from per-item results
    pub fn from_results(results: Vec<ItemResult>, server_timestamp: i64) -> Self {
        let mut response = Self {
            results: Vec::new(),
            success_count: 0,
            conflict_count: 0,
            error_count: 0,
            server_timestamp,
        };
        for result in &results {
            match result {
                ItemResult::Success { .. } => response.success_count += 1,
                ItemResult::Conflict { .. } => response.conflict_count += 1,
                ItemResult::Error { .. } => response.error_count += 1,
            }
        }
        response.results = results;
        response
    }
}

/// Page of `GET /{entity}s?since=`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub items: Vec<RemoteItem>,
    /// Authoritative watermark once every page has been read
    pub server_timestamp: i64,
    #[serde(default)]
    pub has_more: bool,
}

/// `200` body of a single upsert or delete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAccepted {
    pub server_id: String,
    pub version: i64,
}

/// `409` body of a single upsert or delete
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictBody {
    pub error: String,
    pub server_version: i64,
    pub server_data: RemoteItem,
}

/// Result of a single-record write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Accepted(WriteAccepted),
    Conflict {
        server_version: i64,
        server_data: RemoteItem,
    },
}

/// Frames of the change notification channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelMessage {
    SyncRequired {
        entity_type: String,
    },
    ItemChanged {
        entity_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action: Option<String>,
    },
    Ping,
    Pong,
}

impl ChannelMessage {
    /// Entity type a data message asks to pull
    pub fn entity_type(&self) -> Option<&str> {
        match self {
            Self::SyncRequired { entity_type } | Self::ItemChanged { entity_type, .. } => {
                Some(entity_type)
            }
            Self::Ping | Self::Pong => None,
        }
    }
}
