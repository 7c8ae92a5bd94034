//! Record repository implementation

#![allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)] // SQLite uses i64 for LIMIT/OFFSET and counts

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::change_tracker::ChangeTracker;
use super::migrations::entity_table_name;
use crate::error::{Error, Result};
use crate::models::{LocalId, SyncCounts, SyncStatus, SyncableRecord};
use crate::util::unix_millis_now;

const RECORD_COLUMNS: &str = "local_id, server_id, version, sync_status, modified_locally, \
     last_synced, deleted_at, created_at, updated_at, local_revision, payload";

/// Trait for the application-facing record operations
pub trait RecordRepository {
    /// Create a new record
    fn create(&self, payload: &Value) -> Result<SyncableRecord>;

    /// Get a record by local ID (tombstones included)
    fn get(&self, id: &LocalId) -> Result<Option<SyncableRecord>>;

    /// List records, most recently changed first
    fn list(&self, limit: usize, offset: usize, include_deleted: bool)
        -> Result<Vec<SyncableRecord>>;

    /// Replace a record's payload
    fn update(&self, id: &LocalId, payload: &Value) -> Result<SyncableRecord>;

    /// Soft delete a record
    fn delete(&self, id: &LocalId) -> Result<SyncableRecord>;
}

/// `SQLite` implementation of `RecordRepository` for one entity type
pub struct SqliteRecordRepository<'a> {
    conn: &'a Connection,
    table: String,
}

impl<'a> SqliteRecordRepository<'a> {
    /// Create a repository for the given entity type
    pub fn new(conn: &'a Connection, entity_type: &str) -> Result<Self> {
        Ok(Self {
            conn,
            table: entity_table_name(entity_type)?,
        })
    }

    fn tracker(&self) -> ChangeTracker<'_> {
        ChangeTracker::new(self.conn, &self.table)
    }

    fn require(&self, id: &LocalId) -> Result<SyncableRecord> {
        self.get(id)?.ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Parse a record from a database row
    fn parse_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncableRecord> {
        let payload: String = row.get(10)?;
        let payload = serde_json::from_str(&payload)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(10, Type::Text, Box::new(e)))?;
        Ok(SyncableRecord {
            local_id: row.get(0)?,
            server_id: row.get(1)?,
            version: row.get(2)?,
            sync_status: row.get(3)?,
            modified_locally: row.get::<_, i32>(4)? != 0,
            last_synced: row.get(5)?,
            deleted_at: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            local_revision: row.get(9)?,
            payload,
        })
    }

    /// Find the local row linked to a server identifier
    pub fn get_by_server_id(&self, server_id: &str) -> Result<Option<SyncableRecord>> {
        let record = self
            .conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM {} WHERE server_id = ?",
                    self.table
                ),
                params![server_id],
                Self::parse_record,
            )
            .optional()?;
        Ok(record)
    }

    /// All rows the push phase must upload (`pending` or `error`), oldest change first
    pub fn list_pushable(&self) -> Result<Vec<SyncableRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM {}
             WHERE sync_status IN ('pending', 'error')
             ORDER BY updated_at ASC, local_id ASC",
            self.table
        ))?;
        let records = stmt
            .query_map([], Self::parse_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Row counts by status (open conflicts are counted by the conflict repository)
    pub fn counts(&self) -> Result<SyncCounts> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT sync_status, COUNT(*) FROM {} GROUP BY sync_status",
            self.table
        ))?;
        let mut counts = SyncCounts::default();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, SyncStatus>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            let count = count as u64;
            match status {
                SyncStatus::Pending => counts.pending = count,
                SyncStatus::Synced => counts.synced = count,
                SyncStatus::Conflict => counts.conflict = count,
                SyncStatus::Error => counts.error = count,
            }
        }
        Ok(counts)
    }

    /// Apply a successful push.
    ///
    /// The row only becomes `synced` if no local mutation happened since the
    /// pushed snapshot was read (`seen_revision`). Otherwise it adopts the new
    /// `version`/`server_id` as its baseline and stays `pending`.
    /// Returns whether the row is now clean.
    pub fn mark_pushed(
        &self,
        id: &LocalId,
        server_id: &str,
        version: i64,
        seen_revision: i64,
        now: i64,
    ) -> Result<bool> {
        let current = self.require(id)?;
        let clean = current.local_revision == seen_revision;
        if clean {
            self.conn.execute(
                &format!(
                    "UPDATE {} SET server_id = ?, version = MAX(version, ?),
                        sync_status = 'synced', modified_locally = 0, last_synced = ?,
                        synced_revision = MAX(synced_revision, ?)
                     WHERE local_id = ?",
                    self.table
                ),
                params![server_id, version, now, seen_revision, id.as_str()],
            )?;
        } else {
            self.conn.execute(
                &format!(
                    "UPDATE {} SET server_id = ?, version = MAX(version, ?),
                        sync_status = 'pending', modified_locally = 1,
                        synced_revision = MAX(synced_revision, ?)
                     WHERE local_id = ?",
                    self.table
                ),
                params![server_id, version, seen_revision, id.as_str()],
            )?;
        }
        Ok(clean)
    }

    /// Whether the only change since the server last saw this row is its deletion
    pub fn only_deleted_since_sync(&self, id: &LocalId) -> Result<bool> {
        let only_deleted = self
            .conn
            .query_row(
                &format!(
                    "SELECT deleted_at IS NOT NULL AND local_revision = synced_revision + 1
                     FROM {} WHERE local_id = ?",
                    self.table
                ),
                [id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        only_deleted.ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Set the status of a row without touching its content or dirty flag
    pub fn mark_status(&self, id: &LocalId, status: SyncStatus) -> Result<()> {
        if status == SyncStatus::Synced {
            return Err(Error::InvalidInput(
                "synced is only reachable through a push or an overwrite".to_string(),
            ));
        }
        let rows = self.conn.execute(
            &format!("UPDATE {} SET sync_status = ? WHERE local_id = ?", self.table),
            params![status.as_str(), id.as_str()],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Insert a row that so far only existed on the server
    pub fn insert_remote(
        &self,
        server_id: &str,
        payload: &Value,
        deleted_at: Option<i64>,
        version: i64,
        now: i64,
    ) -> Result<LocalId> {
        let local_id = LocalId::new();
        let payload = serde_json::to_string(payload)?;
        self.conn.execute(
            &format!(
                "INSERT INTO {} (local_id, server_id, version, sync_status, modified_locally,
                    last_synced, deleted_at, created_at, updated_at, local_revision,
                    synced_revision, payload)
                 VALUES (?, ?, ?, 'synced', 0, ?, ?, ?, ?, 1, 1, ?)",
                self.table
            ),
            params![
                local_id.as_str(),
                server_id,
                version,
                now,
                deleted_at,
                now,
                now,
                payload
            ],
        )?;
        Ok(local_id)
    }

    /// Replace a row with the server's copy and mark it clean
    pub fn overwrite_from_remote(
        &self,
        id: &LocalId,
        server_id: &str,
        payload: &Value,
        deleted_at: Option<i64>,
        version: i64,
        now: i64,
    ) -> Result<()> {
        let payload = serde_json::to_string(payload)?;
        let rows = self.conn.execute(
            &format!(
                "UPDATE {} SET server_id = ?, payload = ?, deleted_at = ?, version = ?,
                    sync_status = 'synced', modified_locally = 0,
                    last_synced = ?, updated_at = ?, synced_revision = local_revision
                 WHERE local_id = ?",
                self.table
            ),
            params![server_id, payload, deleted_at, version, now, now, id.as_str()],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Re-baseline a row on the server's version so its content is pushed again.
    ///
    /// `payload` replaces the local content when given (merge); otherwise the
    /// local content is kept as is (keep local).
    pub fn rebase_for_push(
        &self,
        id: &LocalId,
        server_id: Option<&str>,
        server_version: i64,
        payload: Option<&Value>,
        now: i64,
    ) -> Result<()> {
        let current = self.require(id)?;
        let payload = serde_json::to_string(payload.unwrap_or(&current.payload))?;
        self.conn.execute(
            &format!(
                "UPDATE {} SET server_id = COALESCE(server_id, ?), version = MAX(version, ?),
                    payload = ?, updated_at = ?,
                    sync_status = 'pending', modified_locally = 1,
                    local_revision = local_revision + 1
                 WHERE local_id = ?",
                self.table
            ),
            params![server_id, server_version, payload, now, id.as_str()],
        )?;
        Ok(())
    }
}

impl RecordRepository for SqliteRecordRepository<'_> {
    fn create(&self, payload: &Value) -> Result<SyncableRecord> {
        let local_id = LocalId::new();
        self.tracker()
            .track_create(&local_id, payload, unix_millis_now())?;
        self.require(&local_id)
    }

    fn get(&self, id: &LocalId) -> Result<Option<SyncableRecord>> {
        let record = self
            .conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM {} WHERE local_id = ?",
                    self.table
                ),
                params![id.as_str()],
                Self::parse_record,
            )
            .optional()?;
        Ok(record)
    }

    fn list(
        &self,
        limit: usize,
        offset: usize,
        include_deleted: bool,
    ) -> Result<Vec<SyncableRecord>> {
        let filter = if include_deleted {
            ""
        } else {
            "WHERE deleted_at IS NULL"
        };
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM {} {filter}
             ORDER BY updated_at DESC, local_id DESC
             LIMIT ? OFFSET ?",
            self.table
        ))?;
        let records = stmt
            .query_map(params![limit as i64, offset as i64], Self::parse_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn update(&self, id: &LocalId, payload: &Value) -> Result<SyncableRecord> {
        self.tracker().track_update(id, payload, unix_millis_now())?;
        self.require(id)
    }

    fn delete(&self, id: &LocalId) -> Result<SyncableRecord> {
        self.tracker().track_delete(id, unix_millis_now())?;
        self.require(id)
    }
}

impl FromSql for LocalId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|error: uuid::Error| FromSqlError::Other(Box::new(error)))
    }
}

impl FromSql for SyncStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|error: Error| FromSqlError::Other(Box::new(error)))
    }
}
