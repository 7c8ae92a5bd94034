//! In-process Remote Sync API over an [`Authority`], with fault injection.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use super::RemoteSyncApi;
use crate::error::{Error, Result};
use crate::protocol::{
    Authority, BulkSyncRequest, BulkSyncResponse, ChangesResponse, PushItem, WriteOutcome,
};

const DEFAULT_PAGE_LIMIT: usize = 500;

struct Faults {
    offline: AtomicBool,
    unauthorized: AtomicBool,
    page_limit: AtomicUsize,
    /// `false` holds every request at the door until reopened
    gate: watch::Sender<bool>,
    requests: watch::Sender<usize>,
}

/// Several clients can share one authority by cloning it into several remotes.
#[derive(Clone)]
pub struct LoopbackRemote {
    authority: Arc<Authority>,
    faults: Arc<Faults>,
}

impl LoopbackRemote {
    pub fn new(authority: Arc<Authority>) -> Self {
        let (gate, _) = watch::channel(true);
        let (requests, _) = watch::channel(0);
        Self {
            authority,
            faults: Arc::new(Faults {
                offline: AtomicBool::new(false),
                unauthorized: AtomicBool::new(false),
                page_limit: AtomicUsize::new(DEFAULT_PAGE_LIMIT),
                gate,
                requests,
            }),
        }
    }

    /// A remote over a fresh, empty authority
    pub fn standalone() -> Self {
        Self::new(Arc::new(Authority::new()))
    }

    pub fn authority(&self) -> &Arc<Authority> {
        &self.authority
    }

    /// Make every request fail as unreachable
    pub fn set_offline(&self, offline: bool) {
        self.faults.offline.store(offline, Ordering::SeqCst);
    }

    /// Make every request fail with a rejected credential
    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.faults.unauthorized.store(unauthorized, Ordering::SeqCst);
    }

    /// Upper bound on items per pull page
    pub fn set_page_limit(&self, limit: usize) {
        self.faults.page_limit.store(limit.max(1), Ordering::SeqCst);
    }

    /// Park incoming requests until [`Self::release_requests`]
    pub fn hold_requests(&self) {
        self.faults.gate.send_replace(false);
    }

    pub fn release_requests(&self) {
        self.faults.gate.send_replace(true);
    }

    /// Requests received so far, including failed ones
    pub fn request_count(&self) -> usize {
        *self.faults.requests.borrow()
    }

    /// Wait until at least `count` requests have been received.
    pub async fn wait_for_requests(&self, count: usize) {
        let mut requests = self.faults.requests.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = requests.wait_for(|seen| *seen >= count).await;
    }

    async fn enter(&self, operation: &str, entity_type: &str) -> Result<()> {
        self.faults.requests.send_modify(|seen| *seen += 1);
        let mut gate = self.faults.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        tracing::trace!(operation, entity_type, "Loopback request");
        if self.faults.offline.load(Ordering::SeqCst) {
            return Err(Error::Network("remote sync API unreachable".to_string()));
        }
        if self.faults.unauthorized.load(Ordering::SeqCst) {
            return Err(Error::Auth("bearer token rejected (401)".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSyncApi for LoopbackRemote {
    async fn bulk_sync(
        &self,
        entity_type: &str,
        request: &BulkSyncRequest,
    ) -> Result<BulkSyncResponse> {
        self.enter("bulk_sync", entity_type).await?;
        self.authority.bulk_sync(entity_type, request)
    }

    async fn upsert(&self, entity_type: &str, item: &PushItem) -> Result<WriteOutcome> {
        self.enter("upsert", entity_type).await?;
        self.authority.upsert(entity_type, item)
    }

    async fn delete(
        &self,
        entity_type: &str,
        server_id: &str,
        version: i64,
    ) -> Result<WriteOutcome> {
        self.enter("delete", entity_type).await?;
        self.authority.delete(entity_type, server_id, version)
    }

    async fn fetch_changes(
        &self,
        entity_type: &str,
        since: Option<i64>,
        limit: Option<usize>,
    ) -> Result<ChangesResponse> {
        self.enter("fetch_changes", entity_type).await?;
        let page_limit = self.faults.page_limit.load(Ordering::SeqCst);
        let limit = limit.map_or(page_limit, |limit| limit.min(page_limit));
        self.authority.changes_since(entity_type, since, limit)
    }
}
