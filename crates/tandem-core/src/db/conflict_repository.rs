//! Conflict history repository

#![allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::{RecordSnapshot, ResolutionStrategy, SyncConflict};

const CONFLICT_COLUMNS: &str = "id, entity_type, local_id, server_id, local_version, \
     server_version, local_data, server_data, detected_at, resolved_at, resolution_strategy, \
     resolved_by";

/// Fields describing a newly detected conflict
#[derive(Debug, Clone)]
pub struct NewConflict<'a> {
    pub entity_type: &'a str,
    pub local_id: &'a str,
    pub server_id: Option<&'a str>,
    pub local_version: i64,
    pub server_version: i64,
    pub local_data: &'a RecordSnapshot,
    pub server_data: &'a RecordSnapshot,
}

/// `SQLite` repository for `sync_conflicts`
pub struct SqliteConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteConflictRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_snapshot(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<RecordSnapshot> {
        let raw: String = row.get(idx)?;
        serde_json::from_str(&raw)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    }

    /// Parse a conflict from a database row
    fn parse_conflict(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncConflict> {
        let strategy = row
            .get::<_, Option<String>>(10)?
            .map(|value| value.parse::<ResolutionStrategy>())
            .transpose()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(10, Type::Text, Box::new(e)))?;
        Ok(SyncConflict {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            local_id: row.get(2)?,
            server_id: row.get(3)?,
            local_version: row.get(4)?,
            server_version: row.get(5)?,
            local_data: Self::parse_snapshot(row, 6)?,
            server_data: Self::parse_snapshot(row, 7)?,
            detected_at: row.get(8)?,
            resolved_at: row.get(9)?,
            resolution_strategy: strategy,
            resolved_by: row.get(11)?,
        })
    }

    /// Record a conflict for a row.
    ///
    /// If the row already has an open conflict, that conflict is refreshed
    /// with the latest server side instead of stacking a duplicate.
    pub fn record(&self, conflict: &NewConflict<'_>, now: i64) -> Result<SyncConflict> {
        let local_data = serde_json::to_string(conflict.local_data)?;
        let server_data = serde_json::to_string(conflict.server_data)?;

        let id = if let Some(open) = self.open_for(conflict.entity_type, conflict.local_id)? {
            self.conn.execute(
                "UPDATE sync_conflicts SET server_id = COALESCE(?, server_id),
                    local_version = ?, server_version = ?,
                    local_data = ?, server_data = ?, detected_at = ?
                 WHERE id = ?",
                params![
                    conflict.server_id,
                    conflict.local_version,
                    conflict.server_version,
                    local_data,
                    server_data,
                    now,
                    open.id
                ],
            )?;
            open.id
        } else {
            self.conn.execute(
                "INSERT INTO sync_conflicts (entity_type, local_id, server_id, local_version,
                    server_version, local_data, server_data, detected_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    conflict.entity_type,
                    conflict.local_id,
                    conflict.server_id,
                    conflict.local_version,
                    conflict.server_version,
                    local_data,
                    server_data,
                    now
                ],
            )?;
            self.conn.last_insert_rowid()
        };

        self.get(id)?
            .ok_or_else(|| Error::Database(format!("conflict {id} vanished after write")))
    }

    /// Get a conflict by ID
    pub fn get(&self, id: i64) -> Result<Option<SyncConflict>> {
        let conflict = self
            .conn
            .query_row(
                &format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE id = ?"),
                params![id],
                Self::parse_conflict,
            )
            .optional()?;
        Ok(conflict)
    }

    /// The open conflict of a row, if any
    pub fn open_for(&self, entity_type: &str, local_id: &str) -> Result<Option<SyncConflict>> {
        let conflict = self
            .conn
            .query_row(
                &format!(
                    "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
                     WHERE entity_type = ? AND local_id = ? AND resolved_at IS NULL
                     ORDER BY id DESC LIMIT 1"
                ),
                params![entity_type, local_id],
                Self::parse_conflict,
            )
            .optional()?;
        Ok(conflict)
    }

    /// List conflicts, newest first
    pub fn list(&self, limit: usize, only_open: bool) -> Result<Vec<SyncConflict>> {
        let filter = if only_open {
            "WHERE resolved_at IS NULL"
        } else {
            ""
        };
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts {filter}
             ORDER BY detected_at DESC, id DESC
             LIMIT ?"
        ))?;
        let conflicts = stmt
            .query_map(params![limit as i64], Self::parse_conflict)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conflicts)
    }

    /// Number of open conflicts for one entity type
    pub fn count_open(&self, entity_type: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sync_conflicts WHERE entity_type = ? AND resolved_at IS NULL",
            params![entity_type],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Close an open conflict
    pub fn mark_resolved(
        &self,
        id: i64,
        strategy: ResolutionStrategy,
        resolved_by: &str,
        now: i64,
    ) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE sync_conflicts SET resolved_at = ?, resolution_strategy = ?, resolved_by = ?
             WHERE id = ? AND resolved_at IS NULL",
            params![now, strategy.as_str(), resolved_by, id],
        )?;
        if rows == 0 {
            return Err(Error::InvalidInput(format!(
                "conflict {id} does not exist or is already resolved"
            )));
        }
        Ok(())
    }
}
