//! Push/pull orchestration across entity types.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::{broadcast, Mutex};

use super::events::{CycleAbort, EntityReport, PhaseCounts, SyncEvent, SyncReport};
use super::resolver::ConflictResolver;
use crate::db::{
    NewConflict, RecordRepository, SqliteConflictRepository, SqliteMetadataRepository,
    SqliteRecordRepository,
};
use crate::entity::EntityRegistry;
use crate::error::{Error, Result};
use crate::models::{
    LocalId, RecordSnapshot, ResolutionStrategy, SyncConflict, SyncStatus, SyncableRecord,
    GLOBAL_METADATA_KEY,
};
use crate::protocol::{BulkSyncRequest, BulkSyncResponse, ItemResult, PushItem, RemoteItem, WriteOutcome};
use crate::remote::RemoteSyncApi;
use crate::services::LocalStore;
use crate::util::unix_millis_now;

pub const DEFAULT_BATCH_SIZE: usize = 100;
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Tuning of a [`SyncManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Rows per bulk-sync request
    pub batch_size: usize,
    /// Items per pull page; the server's default when `None`
    pub pull_page_limit: Option<usize>,
    /// Applied to every new conflict unless `Manual`
    pub default_strategy: ResolutionStrategy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            pull_page_limit: None,
            default_strategy: ResolutionStrategy::Manual,
        }
    }
}

/// Local writes of one push batch or pull page, applied in one transaction
#[derive(Default)]
struct Applied {
    counts: PhaseCounts,
    events: Vec<SyncEvent>,
}

fn push_item(record: &SyncableRecord) -> PushItem {
    PushItem {
        local_id: record.local_id.as_str(),
        server_id: record.server_id.clone(),
        version: record.version,
        payload: record.payload.clone(),
        deleted_at: record.deleted_at,
    }
}

fn snapshot(record: &SyncableRecord) -> RecordSnapshot {
    RecordSnapshot {
        payload: record.payload.clone(),
        deleted_at: record.deleted_at,
    }
}

/// Keeps the local store consistent with the Remote Sync API.
///
/// Owns the single-flight guard: at most one push, pull or cycle runs at a
/// time, and a second caller gets [`Error::SyncInProgress`] instead of
/// waiting.
pub struct SyncManager {
    store: LocalStore,
    remote: Arc<dyn RemoteSyncApi>,
    registry: EntityRegistry,
    resolver: ConflictResolver,
    options: SyncOptions,
    cycle_lock: Mutex<()>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncManager {
    /// Build a manager and create local storage for every registered type.
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteSyncApi>,
        registry: EntityRegistry,
        options: SyncOptions,
    ) -> Result<Self> {
        if registry.is_empty() {
            return Err(Error::InvalidInput(
                "at least one entity type must be registered".to_string(),
            ));
        }
        registry.install(&store)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            store,
            remote,
            resolver: ConflictResolver::new(registry.clone()),
            registry,
            options: SyncOptions {
                batch_size: options.batch_size.max(1),
                ..options
            },
            cycle_lock: Mutex::new(()),
            events,
        })
    }

    pub const fn store(&self) -> &LocalStore {
        &self.store
    }

    pub const fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub const fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Receive cycle, conflict and auth events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Whether a cycle currently holds the guard
    pub fn is_syncing(&self) -> bool {
        self.cycle_lock.try_lock().is_err()
    }

    fn emit(&self, events: Vec<SyncEvent>) {
        for event in events {
            // Nobody listening is fine
            let _ = self.events.send(event);
        }
    }

    fn ensure_registered(&self, entity_type: &str) -> Result<()> {
        if self.registry.contains(entity_type) {
            Ok(())
        } else {
            Err(Error::UnknownEntity(entity_type.to_string()))
        }
    }

    /// Push then pull every entity type in dependency order.
    ///
    /// A network, auth or server failure stops the cycle; entity types already
    /// processed keep their results. The report is also published as
    /// [`SyncEvent::CycleCompleted`].
    pub async fn run_cycle(&self) -> Result<SyncReport> {
        let _guard = self
            .cycle_lock
            .try_lock()
            .map_err(|_| Error::SyncInProgress)?;

        let mut report = SyncReport {
            started_at: unix_millis_now(),
            ..SyncReport::default()
        };
        let entity_types: Vec<String> = self.registry.entity_types().map(str::to_string).collect();

        for (index, entity_type) in entity_types.iter().enumerate() {
            let mut entity = EntityReport {
                entity_type: entity_type.clone(),
                ..EntityReport::default()
            };

            let outcome = match self.push_entity(entity_type).await {
                Ok(push) => {
                    entity.push = push;
                    self.pull_entity(entity_type).await.map(|pull| entity.pull = pull)
                }
                Err(error) => Err(error),
            };

            if let Err(error) = outcome {
                if error.aborts_cycle() {
                    let skipped = entity_types[index + 1..].to_vec();
                    self.abort_cycle(&mut report, entity, &error, skipped);
                    break;
                }
                tracing::error!(entity_type = %entity_type, %error, "Sync phase failed");
                self.record_error(entity_type, &error.to_string());
                entity.error = Some(error.to_string());
            }
            report.entities.push(entity);
        }

        report.finished_at = unix_millis_now();
        tracing::info!(
            pushed = report.pushed(),
            pulled = report.pulled(),
            conflicts = report.conflicts(),
            errors = report.errors(),
            aborted = report.aborted.is_some(),
            "Sync cycle finished"
        );
        self.emit(vec![SyncEvent::CycleCompleted(report.clone())]);
        Ok(report)
    }

    fn abort_cycle(
        &self,
        report: &mut SyncReport,
        mut entity: EntityReport,
        error: &Error,
        skipped: Vec<String>,
    ) {
        tracing::warn!(
            entity_type = %entity.entity_type,
            %error,
            skipped = skipped.len(),
            "Sync cycle aborted"
        );
        self.record_error(GLOBAL_METADATA_KEY, &error.to_string());
        if error.is_auth() {
            self.emit(vec![SyncEvent::AuthRequired {
                message: error.to_string(),
            }]);
        }
        entity.error = Some(error.to_string());
        report.aborted = Some(CycleAbort {
            entity_type: entity.entity_type.clone(),
            message: error.to_string(),
            auth_required: error.is_auth(),
            skipped,
        });
        report.entities.push(entity);
    }

    fn record_error(&self, key: &str, message: &str) {
        let recorded = self
            .store
            .with_connection(|conn| SqliteMetadataRepository::new(conn).record_error(key, message));
        if let Err(error) = recorded {
            tracing::error!(%error, "Failed to record sync error");
        }
    }

    /// Upload pending and errored rows of one entity type.
    pub async fn push(&self, entity_type: &str) -> Result<PhaseCounts> {
        self.ensure_registered(entity_type)?;
        let _guard = self
            .cycle_lock
            .try_lock()
            .map_err(|_| Error::SyncInProgress)?;
        self.push_entity(entity_type).await
    }

    /// Fetch and apply remote changes of one entity type.
    pub async fn pull(&self, entity_type: &str) -> Result<PhaseCounts> {
        self.ensure_registered(entity_type)?;
        let _guard = self
            .cycle_lock
            .try_lock()
            .map_err(|_| Error::SyncInProgress)?;
        self.pull_entity(entity_type).await
    }

    async fn push_entity(&self, entity_type: &str) -> Result<PhaseCounts> {
        let rows = self.store.with_connection(|conn| {
            SqliteRecordRepository::new(conn, entity_type)?.list_pushable()
        })?;
        let mut counts = PhaseCounts::default();
        if rows.is_empty() {
            return Ok(counts);
        }

        for (batch, chunk) in rows.chunks(self.options.batch_size).enumerate() {
            let request = BulkSyncRequest {
                items: chunk.iter().map(push_item).collect(),
            };
            tracing::debug!(entity_type, batch, items = chunk.len(), "Pushing batch");
            let response = self.remote.bulk_sync(entity_type, &request).await?;

            let applied = self.store.transaction(|tx| {
                self.apply_push_results(tx, entity_type, chunk, &response)
            })?;
            tracing::debug!(
                entity_type,
                batch,
                success = response.success_count,
                conflicts = response.conflict_count,
                errors = response.error_count,
                "Applied batch results"
            );
            counts.add(applied.counts);
            self.emit(applied.events);
        }

        self.store.with_connection(|conn| {
            SqliteMetadataRepository::new(conn).set_last_push(entity_type, unix_millis_now())
        })?;
        Ok(counts)
    }

    fn apply_push_results(
        &self,
        conn: &Connection,
        entity_type: &str,
        chunk: &[SyncableRecord],
        response: &BulkSyncResponse,
    ) -> Result<Applied> {
        let records = SqliteRecordRepository::new(conn, entity_type)?;
        let metadata = SqliteMetadataRepository::new(conn);
        let sent: HashMap<String, &SyncableRecord> = chunk
            .iter()
            .map(|record| (record.local_id.as_str(), record))
            .collect();
        let now = unix_millis_now();
        let mut applied = Applied::default();

        for result in &response.results {
            let Some(record) = sent.get(result.local_id()) else {
                tracing::warn!(entity_type, local_id = result.local_id(), "Result for an item never sent");
                continue;
            };
            match result {
                ItemResult::Success {
                    server_id, version, ..
                } => {
                    let clean = records.mark_pushed(
                        &record.local_id,
                        server_id,
                        *version,
                        record.local_revision,
                        now,
                    )?;
                    if !clean {
                        tracing::debug!(
                            entity_type,
                            local_id = %record.local_id,
                            "Edited while in flight; stays pending"
                        );
                    }
                    applied.counts.applied += 1;
                }
                ItemResult::Conflict {
                    server_version,
                    server_data,
                    ..
                } => {
                    self.handle_conflict(
                        conn,
                        entity_type,
                        &record.local_id,
                        *server_version,
                        server_data,
                        now,
                        &mut applied,
                    )?;
                }
                ItemResult::Error { error, .. } => {
                    tracing::warn!(entity_type, local_id = %record.local_id, %error, "Item rejected");
                    records.mark_status(&record.local_id, SyncStatus::Error)?;
                    metadata.record_error(entity_type, &format!("{}: {error}", record.local_id))?;
                    applied.counts.errors += 1;
                }
            }
        }

        let answered = response.results.len();
        if answered < chunk.len() {
            tracing::warn!(
                entity_type,
                missing = chunk.len() - answered,
                "Batch response left items unanswered; they stay pending"
            );
        }
        Ok(applied)
    }

    /// Record a conflict for a local row, then auto-resolve or announce it.
    #[allow(clippy::too_many_arguments)]
    fn handle_conflict(
        &self,
        conn: &Connection,
        entity_type: &str,
        local_id: &LocalId,
        server_version: i64,
        server_data: &RemoteItem,
        now: i64,
        applied: &mut Applied,
    ) -> Result<()> {
        let records = SqliteRecordRepository::new(conn, entity_type)?;
        let current = records
            .get(local_id)?
            .ok_or_else(|| Error::NotFound(local_id.to_string()))?;
        let local_data = snapshot(&current);
        let server_snapshot = server_data.snapshot();
        let local_key = local_id.as_str();

        let conflict = SqliteConflictRepository::new(conn).record(
            &NewConflict {
                entity_type,
                local_id: &local_key,
                server_id: Some(&server_data.server_id),
                local_version: current.version,
                server_version,
                local_data: &local_data,
                server_data: &server_snapshot,
            },
            now,
        )?;
        records.mark_status(local_id, SyncStatus::Conflict)?;
        applied.counts.conflicts += 1;
        tracing::warn!(
            entity_type,
            local_id = %local_id,
            local_version = current.version,
            server_version,
            "Version conflict"
        );

        self.settle(conn, conflict, now, applied)
    }

    fn settle(
        &self,
        conn: &Connection,
        conflict: SyncConflict,
        now: i64,
        applied: &mut Applied,
    ) -> Result<()> {
        let strategy = self.options.default_strategy;
        if strategy == ResolutionStrategy::Manual {
            applied.events.push(SyncEvent::ConflictDetected {
                conflict_id: conflict.id,
                entity_type: conflict.entity_type,
                local_id: conflict.local_id,
            });
            return Ok(());
        }
        conn.execute_batch("SAVEPOINT auto_resolve")?;
        match self.resolver.resolve(conn, &conflict, strategy, "auto", now) {
            Ok(_) => {
                conn.execute_batch("RELEASE auto_resolve")?;
                applied.counts.auto_resolved += 1;
            }
            Err(error) => {
                conn.execute_batch("ROLLBACK TO auto_resolve; RELEASE auto_resolve")?;
                tracing::warn!(
                    conflict_id = conflict.id,
                    entity_type = %conflict.entity_type,
                    local_id = %conflict.local_id,
                    strategy = strategy.as_str(),
                    %error,
                    "Automatic resolution failed; conflict left open"
                );
                applied.events.push(SyncEvent::ConflictDetected {
                    conflict_id: conflict.id,
                    entity_type: conflict.entity_type,
                    local_id: conflict.local_id,
                });
            }
        }
        Ok(())
    }

    async fn pull_entity(&self, entity_type: &str) -> Result<PhaseCounts> {
        let mut since = self.store.metadata(entity_type)?.last_pull_timestamp;
        let mut counts = PhaseCounts::default();

        loop {
            let page = self
                .remote
                .fetch_changes(entity_type, since, self.options.pull_page_limit)
                .await?;
            let watermark = if page.has_more {
                page.items
                    .last()
                    .map_or(page.server_timestamp, |item| item.updated_at)
            } else {
                page.server_timestamp
            };

            let applied = self.store.transaction(|tx| {
                let mut applied = Applied::default();
                for item in &page.items {
                    self.apply_remote_item(tx, entity_type, item, &mut applied)?;
                }
                SqliteMetadataRepository::new(tx).set_last_pull(entity_type, watermark)?;
                Ok(applied)
            })?;
            tracing::debug!(
                entity_type,
                items = page.items.len(),
                watermark,
                has_more = page.has_more,
                "Applied pull page"
            );
            counts.add(applied.counts);
            self.emit(applied.events);

            if !page.has_more || page.items.is_empty() {
                break;
            }
            since = Some(watermark);
        }
        Ok(counts)
    }

    fn find_local(
        records: &SqliteRecordRepository<'_>,
        item: &RemoteItem,
    ) -> Result<Option<SyncableRecord>> {
        if let Some(record) = records.get_by_server_id(&item.server_id)? {
            return Ok(Some(record));
        }
        // A create whose response was lost: the row exists but is unlinked
        let Some(origin) = item.local_id.as_deref().and_then(|id| id.parse::<LocalId>().ok())
        else {
            return Ok(None);
        };
        Ok(records.get(&origin)?.filter(SyncableRecord::is_new))
    }

    fn apply_remote_item(
        &self,
        conn: &Connection,
        entity_type: &str,
        item: &RemoteItem,
        applied: &mut Applied,
    ) -> Result<()> {
        let records = SqliteRecordRepository::new(conn, entity_type)?;
        let now = unix_millis_now();

        let Some(local) = Self::find_local(&records, item)? else {
            records.insert_remote(&item.server_id, &item.payload, item.deleted_at, item.version, now)?;
            applied.counts.applied += 1;
            return Ok(());
        };

        if item.version <= local.version {
            applied.counts.skipped += 1;
            return Ok(());
        }
        if local.modified_locally {
            return self.handle_conflict(
                conn,
                entity_type,
                &local.local_id,
                item.version,
                item,
                now,
                applied,
            );
        }
        records.overwrite_from_remote(
            &local.local_id,
            &item.server_id,
            &item.payload,
            item.deleted_at,
            item.version,
            now,
        )?;
        applied.counts.applied += 1;
        Ok(())
    }

    /// Push one row right after a local save or delete.
    ///
    /// A tombstone whose content the server already holds goes through the
    /// delete endpoint; everything else, including an edit followed by a
    /// delete, goes through the single upsert.
    pub async fn push_record(&self, entity_type: &str, local_id: &LocalId) -> Result<PhaseCounts> {
        self.ensure_registered(entity_type)?;
        let _guard = self
            .cycle_lock
            .try_lock()
            .map_err(|_| Error::SyncInProgress)?;

        let record = self
            .store
            .get_record(entity_type, local_id)?
            .ok_or_else(|| Error::NotFound(local_id.to_string()))?;
        let mut counts = PhaseCounts::default();
        if !record.sync_status.is_pushable() {
            return Ok(counts);
        }

        let only_deleted = self.store.with_connection(|conn| {
            SqliteRecordRepository::new(conn, entity_type)?.only_deleted_since_sync(local_id)
        })?;
        let outcome = match &record.server_id {
            Some(server_id) if only_deleted => {
                self.remote
                    .delete(entity_type, server_id, record.version)
                    .await
            }
            _ => self.remote.upsert(entity_type, &push_item(&record)).await,
        };

        let applied = match outcome {
            Ok(WriteOutcome::Accepted(accepted)) => self.store.transaction(|tx| {
                SqliteRecordRepository::new(tx, entity_type)?.mark_pushed(
                    local_id,
                    &accepted.server_id,
                    accepted.version,
                    record.local_revision,
                    unix_millis_now(),
                )?;
                Ok(Applied {
                    counts: PhaseCounts {
                        applied: 1,
                        ..PhaseCounts::default()
                    },
                    events: Vec::new(),
                })
            })?,
            Ok(WriteOutcome::Conflict {
                server_version,
                server_data,
            }) => self.store.transaction(|tx| {
                let mut applied = Applied::default();
                self.handle_conflict(
                    tx,
                    entity_type,
                    local_id,
                    server_version,
                    &server_data,
                    unix_millis_now(),
                    &mut applied,
                )?;
                Ok(applied)
            })?,
            Err(error @ (Error::Validation(_) | Error::NotFound(_))) => {
                tracing::warn!(entity_type, local_id = %local_id, %error, "Record rejected");
                self.store.transaction(|tx| {
                    SqliteRecordRepository::new(tx, entity_type)?
                        .mark_status(local_id, SyncStatus::Error)?;
                    SqliteMetadataRepository::new(tx)
                        .record_error(entity_type, &format!("{local_id}: {error}"))?;
                    Ok(Applied {
                        counts: PhaseCounts {
                            errors: 1,
                            ..PhaseCounts::default()
                        },
                        events: Vec::new(),
                    })
                })?
            }
            Err(error) => {
                if error.aborts_cycle() {
                    self.record_error(GLOBAL_METADATA_KEY, &error.to_string());
                }
                if error.is_auth() {
                    self.emit(vec![SyncEvent::AuthRequired {
                        message: error.to_string(),
                    }]);
                }
                return Err(error);
            }
        };

        counts.add(applied.counts);
        self.emit(applied.events);
        Ok(counts)
    }

    /// Settle an open conflict with a concrete strategy chosen by the user.
    pub fn resolve_conflict(
        &self,
        conflict_id: i64,
        strategy: ResolutionStrategy,
    ) -> Result<SyncConflict> {
        self.store.transaction(|tx| {
            let conflicts = SqliteConflictRepository::new(tx);
            let conflict = conflicts
                .get(conflict_id)?
                .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))?;
            self.resolver
                .resolve(tx, &conflict, strategy, "user", unix_millis_now())?;
            conflicts
                .get(conflict_id)?
                .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))
        })
    }
}
