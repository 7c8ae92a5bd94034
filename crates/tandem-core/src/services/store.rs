//! Shared local store used by the application and the sync worker.
//!
//! All access goes through one `SQLite` connection behind a mutex, so a user
//! edit and an in-flight pull can never interleave inside a write of the
//! `version`/`modified_locally` pair.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Transaction;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::db::{
    Database, RecordRepository, SqliteConflictRepository, SqliteMetadataRepository,
    SqliteRecordRepository,
};
use crate::error::{Error, Result};
use crate::models::{LocalId, SyncConflict, SyncCounts, SyncMetadata, SyncableRecord};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Kind of local mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Emitted after every successful local mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalChange {
    pub entity_type: String,
    pub local_id: LocalId,
    pub kind: LocalChangeKind,
}

/// Thread-safe handle to the embedded store.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
    changes: broadcast::Sender<LocalChange>,
}

impl LocalStore {
    fn from_database(db: Database, db_path: Option<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            db: Arc::new(Mutex::new(db)),
            db_path,
            changes,
        }
    }

    /// Open a store at the given filesystem path.
    pub fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::open(&db_path)?;
        tracing::info!("Opened local store at {}", db_path.display());
        Ok(Self::from_database(db, Some(db_path)))
    }

    /// Open an in-memory store (primarily for tests).
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory()?, None))
    }

    /// Path of the backing file, when not in memory.
    pub fn path(&self) -> Option<&PathBuf> {
        self.db_path.as_ref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|_| Error::Database("local store lock poisoned".to_string()))
    }

    /// Run `f` with the connection held.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&rusqlite::Connection) -> Result<T>,
    ) -> Result<T> {
        let db = self.lock()?;
        f(db.connection())
    }

    /// Run `f` inside one transaction; it commits only if `f` succeeds.
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut db = self.lock()?;
        let tx = db.connection_mut().transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Create the storage for an entity type if needed.
    pub fn register_entity(&self, entity_type: &str) -> Result<()> {
        self.lock()?.register_entity(entity_type)
    }

    /// Entity types that have storage, in registration order.
    pub fn registered_entities(&self) -> Result<Vec<String>> {
        self.lock()?.registered_entities()
    }

    /// Subscribe to local mutations.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<LocalChange> {
        self.changes.subscribe()
    }

    fn publish(&self, entity_type: &str, record: &SyncableRecord, kind: LocalChangeKind) {
        // No subscribers is fine
        let _ = self.changes.send(LocalChange {
            entity_type: entity_type.to_string(),
            local_id: record.local_id,
            kind,
        });
    }

    /// Create a record.
    pub fn create_record(&self, entity_type: &str, payload: &Value) -> Result<SyncableRecord> {
        let record = {
            let db = self.lock()?;
            SqliteRecordRepository::new(db.connection(), entity_type)?.create(payload)?
        };
        self.publish(entity_type, &record, LocalChangeKind::Created);
        Ok(record)
    }

    /// Replace a record's payload.
    pub fn update_record(
        &self,
        entity_type: &str,
        id: &LocalId,
        payload: &Value,
    ) -> Result<SyncableRecord> {
        let record = {
            let db = self.lock()?;
            SqliteRecordRepository::new(db.connection(), entity_type)?.update(id, payload)?
        };
        self.publish(entity_type, &record, LocalChangeKind::Updated);
        Ok(record)
    }

    /// Soft-delete a record.
    pub fn delete_record(&self, entity_type: &str, id: &LocalId) -> Result<SyncableRecord> {
        let record = {
            let db = self.lock()?;
            SqliteRecordRepository::new(db.connection(), entity_type)?.delete(id)?
        };
        self.publish(entity_type, &record, LocalChangeKind::Deleted);
        Ok(record)
    }

    /// Fetch a record by local id (tombstones included).
    pub fn get_record(&self, entity_type: &str, id: &LocalId) -> Result<Option<SyncableRecord>> {
        let db = self.lock()?;
        SqliteRecordRepository::new(db.connection(), entity_type)?.get(id)
    }

    /// Fetch a record by server id.
    pub fn get_record_by_server_id(
        &self,
        entity_type: &str,
        server_id: &str,
    ) -> Result<Option<SyncableRecord>> {
        let db = self.lock()?;
        SqliteRecordRepository::new(db.connection(), entity_type)?.get_by_server_id(server_id)
    }

    /// List records newest-first.
    pub fn list_records(
        &self,
        entity_type: &str,
        limit: usize,
        offset: usize,
        include_deleted: bool,
    ) -> Result<Vec<SyncableRecord>> {
        let db = self.lock()?;
        SqliteRecordRepository::new(db.connection(), entity_type)?.list(
            limit,
            offset,
            include_deleted,
        )
    }

    /// Pending / conflict / error / synced counts plus open conflicts.
    pub fn counts(&self, entity_type: &str) -> Result<SyncCounts> {
        let db = self.lock()?;
        let mut counts = SqliteRecordRepository::new(db.connection(), entity_type)?.counts()?;
        counts.open_conflicts =
            SqliteConflictRepository::new(db.connection()).count_open(entity_type)?;
        Ok(counts)
    }

    /// List conflicts newest-first.
    pub fn list_conflicts(&self, limit: usize, only_open: bool) -> Result<Vec<SyncConflict>> {
        let db = self.lock()?;
        SqliteConflictRepository::new(db.connection()).list(limit, only_open)
    }

    /// Fetch a conflict by id.
    pub fn get_conflict(&self, id: i64) -> Result<Option<SyncConflict>> {
        let db = self.lock()?;
        SqliteConflictRepository::new(db.connection()).get(id)
    }

    /// Sync metadata of an entity type.
    pub fn metadata(&self, entity_type: &str) -> Result<SyncMetadata> {
        let db = self.lock()?;
        SqliteMetadataRepository::new(db.connection()).get(entity_type)
    }

    /// All sync metadata rows.
    pub fn list_metadata(&self) -> Result<Vec<SyncMetadata>> {
        let db = self.lock()?;
        SqliteMetadataRepository::new(db.connection()).list()
    }
}
