//! Change tracking for local mutations.
//!
//! Every create, update and soft delete issued by the application goes through
//! [`ChangeTracker`], which writes the new content and the dirty flags in the
//! same statement. If the write fails, nothing is marked; if it succeeds, the
//! row is `pending` with `modified_locally = 1`. `version` is never touched
//! here: it tracks the last state agreed with the server, not the local draft.

use rusqlite::{params, Connection};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::LocalId;

/// Writes local mutations together with their sync bookkeeping
pub struct ChangeTracker<'a> {
    conn: &'a Connection,
    table: &'a str,
}

impl<'a> ChangeTracker<'a> {
    /// Create a tracker for one entity table
    pub const fn new(conn: &'a Connection, table: &'a str) -> Self {
        Self { conn, table }
    }

    /// Insert a brand new local row (`version = 1`, no `server_id`)
    pub fn track_create(&self, local_id: &LocalId, payload: &Value, now: i64) -> Result<()> {
        let payload = serde_json::to_string(payload)?;
        self.conn.execute(
            &format!(
                "INSERT INTO {} (local_id, server_id, version, sync_status, modified_locally,
                    last_synced, deleted_at, created_at, updated_at, local_revision, payload)
                 VALUES (?, NULL, 1, 'pending', 1, NULL, NULL, ?, ?, 1, ?)",
                self.table
            ),
            params![local_id.as_str(), now, now, payload],
        )?;
        Ok(())
    }

    /// Replace the payload of a live row
    pub fn track_update(&self, local_id: &LocalId, payload: &Value, now: i64) -> Result<()> {
        let payload = serde_json::to_string(payload)?;
        let rows = self.conn.execute(
            &format!(
                "UPDATE {} SET payload = ?, updated_at = ?,
                    sync_status = 'pending', modified_locally = 1,
                    local_revision = local_revision + 1
                 WHERE local_id = ? AND deleted_at IS NULL",
                self.table
            ),
            params![payload, now, local_id.as_str()],
        )?;
        Self::require_row(rows, local_id)
    }

    /// Tombstone a live row; it stays in the table so the deletion can sync
    pub fn track_delete(&self, local_id: &LocalId, now: i64) -> Result<()> {
        let rows = self.conn.execute(
            &format!(
                "UPDATE {} SET deleted_at = ?, updated_at = ?,
                    sync_status = 'pending', modified_locally = 1,
                    local_revision = local_revision + 1
                 WHERE local_id = ? AND deleted_at IS NULL",
                self.table
            ),
            params![now, now, local_id.as_str()],
        )?;
        Self::require_row(rows, local_id)
    }

    fn require_row(rows: usize, local_id: &LocalId) -> Result<()> {
        if rows == 0 {
            Err(Error::NotFound(local_id.to_string()))
        } else {
            Ok(())
        }
    }
}
