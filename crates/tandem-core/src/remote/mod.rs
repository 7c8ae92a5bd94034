//! Clients of the Remote Sync API

mod http;
mod loopback;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{BulkSyncRequest, BulkSyncResponse, ChangesResponse, PushItem, WriteOutcome};

pub use http::HttpRemoteApi;
pub use loopback::LoopbackRemote;

/// The four endpoints of the Remote Sync API.
///
/// Version conflicts are outcomes, never errors. Errors are classified so the
/// manager can tell per-item failures from cycle-level ones.
#[async_trait]
pub trait RemoteSyncApi: Send + Sync {
    /// `POST /{entity}/bulk-sync`
    async fn bulk_sync(
        &self,
        entity_type: &str,
        request: &BulkSyncRequest,
    ) -> Result<BulkSyncResponse>;

    /// `POST /{entity}`
    async fn upsert(&self, entity_type: &str, item: &PushItem) -> Result<WriteOutcome>;

    /// `DELETE /{entity}/{id}?version=`
    async fn delete(&self, entity_type: &str, server_id: &str, version: i64)
        -> Result<WriteOutcome>;

    /// `GET /{entity}s?since=&limit=`
    async fn fetch_changes(
        &self,
        entity_type: &str,
        since: Option<i64>,
        limit: Option<usize>,
    ) -> Result<ChangesResponse>;
}
