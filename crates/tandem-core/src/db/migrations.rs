//! Database migrations

use regex::Regex;
use rusqlite::Connection;

use crate::error::{Error, Result};

/// Current schema version
const CURRENT_VERSION: i32 = 2;

const ENTITY_TYPE_PATTERN: &str = r"^[a-z][a-z0-9_]{0,47}$";

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Migration to version 1: sync bookkeeping tables
fn migrate_v1(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );
        CREATE TABLE IF NOT EXISTS sync_metadata (
            entity_type TEXT PRIMARY KEY,
            last_pull_timestamp INTEGER,
            last_push_timestamp INTEGER,
            sync_errors_count INTEGER NOT NULL DEFAULT 0,
            last_error_message TEXT
        );
        CREATE TABLE IF NOT EXISTS registered_entities (
            entity_type TEXT PRIMARY KEY,
            table_name TEXT NOT NULL UNIQUE,
            registered_at INTEGER NOT NULL
        );
        INSERT INTO schema_version (version) VALUES (1);",
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: conflict history
fn migrate_v2(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS sync_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            local_id TEXT NOT NULL,
            server_id TEXT,
            local_version INTEGER NOT NULL,
            server_version INTEGER NOT NULL,
            local_data TEXT NOT NULL,
            server_data TEXT NOT NULL,
            detected_at INTEGER NOT NULL,
            resolved_at INTEGER,
            resolution_strategy TEXT,
            resolved_by TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_sync_conflicts_record
            ON sync_conflicts(entity_type, local_id);
        CREATE INDEX IF NOT EXISTS idx_sync_conflicts_open
            ON sync_conflicts(resolved_at) WHERE resolved_at IS NULL;
        CREATE INDEX IF NOT EXISTS idx_sync_conflicts_detected_at
            ON sync_conflicts(detected_at DESC);
        INSERT INTO schema_version (version) VALUES (2);",
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}

/// Table holding the rows of one entity type.
///
/// Entity types become part of SQL identifiers, so only lowercase
/// identifiers are accepted.
pub fn entity_table_name(entity_type: &str) -> Result<String> {
    let pattern = Regex::new(ENTITY_TYPE_PATTERN)
        .map_err(|error| Error::InvalidInput(format!("entity type pattern: {error}")))?;
    if pattern.is_match(entity_type) {
        Ok(format!("records_{entity_type}"))
    } else {
        Err(Error::InvalidInput(format!(
            "entity type must match [a-z][a-z0-9_]*: {entity_type:?}"
        )))
    }
}

/// Create the table, indexes and guards for one entity type (idempotent)
pub fn ensure_entity_table(conn: &Connection, entity_type: &str) -> Result<String> {
    let table = entity_table_name(entity_type)?;
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            local_id TEXT PRIMARY KEY,
            server_id TEXT UNIQUE,
            version INTEGER NOT NULL DEFAULT 1 CHECK (version >= 1),
            sync_status TEXT NOT NULL DEFAULT 'pending'
                CHECK (sync_status IN ('pending', 'synced', 'conflict', 'error')),
            modified_locally INTEGER NOT NULL DEFAULT 1,
            last_synced INTEGER,
            deleted_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            local_revision INTEGER NOT NULL DEFAULT 1,
            synced_revision INTEGER NOT NULL DEFAULT 0,
            payload TEXT NOT NULL,
            CHECK (modified_locally = 0 OR sync_status <> 'synced')
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_status ON {table}(sync_status);
        CREATE INDEX IF NOT EXISTS idx_{table}_updated ON {table}(updated_at DESC);
        CREATE TRIGGER IF NOT EXISTS {table}_version_guard BEFORE UPDATE OF version ON {table}
        FOR EACH ROW
        WHEN NEW.version < OLD.version
        BEGIN
            SELECT RAISE(ABORT, 'record version must not decrease');
        END;"
    ))?;
    tx.execute(
        "INSERT OR IGNORE INTO registered_entities (entity_type, table_name, registered_at)
         VALUES (?, ?, ?)",
        rusqlite::params![entity_type, table, crate::util::unix_millis_now()],
    )?;
    tx.commit()?;

    tracing::debug!(entity_type, table, "Entity table ready");
    Ok(table)
}
