//! Sync metadata repository

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::SyncMetadata;
use crate::util::compact_text;

/// `SQLite` repository for `sync_metadata`
pub struct SqliteMetadataRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteMetadataRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_metadata(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncMetadata> {
        Ok(SyncMetadata {
            entity_type: row.get(0)?,
            last_pull_timestamp: row.get(1)?,
            last_push_timestamp: row.get(2)?,
            sync_errors_count: row.get(3)?,
            last_error_message: row.get(4)?,
        })
    }

    /// Load the metadata of an entity type (defaults when never synced)
    pub fn get(&self, entity_type: &str) -> Result<SyncMetadata> {
        let metadata = self
            .conn
            .query_row(
                "SELECT entity_type, last_pull_timestamp, last_push_timestamp,
                    sync_errors_count, last_error_message
                 FROM sync_metadata WHERE entity_type = ?",
                params![entity_type],
                Self::parse_metadata,
            )
            .optional()?;
        Ok(metadata.unwrap_or_else(|| SyncMetadata {
            entity_type: entity_type.to_string(),
            ..SyncMetadata::default()
        }))
    }

    /// All metadata rows
    pub fn list(&self) -> Result<Vec<SyncMetadata>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_type, last_pull_timestamp, last_push_timestamp,
                sync_errors_count, last_error_message
             FROM sync_metadata ORDER BY entity_type",
        )?;
        let rows = stmt
            .query_map([], Self::parse_metadata)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Advance the pull watermark (never moves backwards)
    pub fn set_last_pull(&self, entity_type: &str, server_timestamp: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_metadata (entity_type, last_pull_timestamp) VALUES (?, ?)
             ON CONFLICT(entity_type) DO UPDATE SET last_pull_timestamp =
                MAX(COALESCE(last_pull_timestamp, 0), excluded.last_pull_timestamp)",
            params![entity_type, server_timestamp],
        )?;
        Ok(())
    }

    /// Record the completion time of a push
    pub fn set_last_push(&self, entity_type: &str, timestamp: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_metadata (entity_type, last_push_timestamp) VALUES (?, ?)
             ON CONFLICT(entity_type) DO UPDATE SET last_push_timestamp = excluded.last_push_timestamp",
            params![entity_type, timestamp],
        )?;
        Ok(())
    }

    /// Count one error and remember its message
    pub fn record_error(&self, entity_type: &str, message: &str) -> Result<()> {
        let message = compact_text(message);
        self.conn.execute(
            "INSERT INTO sync_metadata (entity_type, sync_errors_count, last_error_message)
             VALUES (?, 1, ?)
             ON CONFLICT(entity_type) DO UPDATE SET
                sync_errors_count = sync_errors_count + 1,
                last_error_message = excluded.last_error_message",
            params![entity_type, message],
        )?;
        Ok(())
    }
}
