use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tandem_core::config::SyncSettings;
use tandem_core::models::{LocalId, SyncConflict, SyncableRecord};
use tandem_core::sync::SyncManager;
use tandem_core::{EntityRegistry, LocalStore};

use crate::error::CliError;

/// Rows scanned when matching an ID prefix
const PREFIX_SCAN_PAGE: usize = 500;

#[derive(Debug, Serialize)]
pub struct RecordListItem {
    pub id: String,
    pub server_id: Option<String>,
    pub version: i64,
    pub status: String,
    pub modified_locally: bool,
    pub deleted: bool,
    pub updated_at: i64,
    pub relative_time: String,
    pub payload: Value,
}

#[derive(Debug, Serialize)]
pub struct ConflictItem {
    pub id: i64,
    pub entity_type: String,
    pub local_id: String,
    pub local_version: i64,
    pub server_version: i64,
    pub detected_at: i64,
    pub detected_at_iso: String,
    pub resolved: bool,
    pub strategy: Option<String>,
    pub resolved_by: Option<String>,
    pub local_payload: Value,
    pub server_payload: Value,
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> Result<PathBuf, CliError> {
    if let Some(path) = cli_db_path.or_else(|| env::var_os("TANDEM_DB_PATH").map(PathBuf::from)) {
        return Ok(path);
    }
    default_db_path().ok_or(CliError::NoDataDir)
}

pub fn default_db_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("tandem").join("tandem.db"))
}

pub fn open_store(path: &Path) -> Result<LocalStore, CliError> {
    Ok(LocalStore::open_path(path)?)
}

/// Manager over the on-disk store and the configured HTTP remote.
pub fn open_manager(settings: &SyncSettings, db_path: &Path) -> Result<Arc<SyncManager>, CliError> {
    let store = open_store(db_path)?;
    let manager = SyncManager::new(
        store,
        Arc::new(settings.remote()?),
        settings.registry()?,
        settings.sync_options(),
    )?;
    Ok(Arc::new(manager))
}

/// Registry over whatever entity types already have local storage.
pub fn local_registry(store: &LocalStore) -> Result<EntityRegistry, CliError> {
    Ok(EntityRegistry::from_names(store.registered_entities()?)?)
}

pub fn resolve_payload(raw: Option<&str>) -> Result<Value, CliError> {
    let text = match raw {
        Some(text) => normalize_content(text),
        None => read_piped_stdin()?,
    }
    .ok_or(CliError::EmptyPayload)?;
    parse_payload(&text)
}

pub fn parse_payload(text: &str) -> Result<Value, CliError> {
    let value: Value =
        serde_json::from_str(text).map_err(|error| CliError::InvalidPayload(error.to_string()))?;
    if !value.is_object() {
        return Err(CliError::InvalidPayload(format!(
            "got {}",
            compact_json(&value, 40)
        )));
    }
    Ok(value)
}

pub fn normalize_content(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn normalize_record_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyRecordId)
    } else {
        Ok(trimmed.to_ascii_lowercase())
    }
}

pub fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    Ok(normalize_content(&buffer))
}

/// Find a record by full local ID or by a unique prefix of it.
pub fn resolve_record(
    store: &LocalStore,
    entity_type: &str,
    query: &str,
) -> Result<SyncableRecord, CliError> {
    let query = normalize_record_identifier(query)?;
    if let Ok(id) = query.parse::<LocalId>() {
        return store
            .get_record(entity_type, &id)?
            .ok_or(CliError::RecordNotFound(query));
    }

    let mut matches = Vec::new();
    let mut offset = 0usize;
    loop {
        let batch = store.list_records(entity_type, PREFIX_SCAN_PAGE, offset, true)?;
        let count = batch.len();
        matches.extend(
            batch
                .into_iter()
                .filter(|record| record.local_id.as_str().starts_with(&query)),
        );
        if count < PREFIX_SCAN_PAGE {
            break;
        }
        offset += count;
    }

    match matches.len() {
        0 => Err(CliError::RecordNotFound(query)),
        1 => Ok(matches.remove(0)),
        count => {
            let preview = matches
                .iter()
                .take(5)
                .map(|record| short_id(&record.local_id))
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousRecordId(format!(
                "ID prefix '{query}' matches {count} records ({preview}). Use a longer prefix."
            )))
        }
    }
}

pub fn short_id(id: &LocalId) -> String {
    id.as_str().chars().take(13).collect()
}

pub fn compact_json(value: &Value, max_chars: usize) -> String {
    let text = value.to_string();
    if text.chars().count() <= max_chars {
        return text;
    }
    let mut preview: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    preview.push_str("...");
    preview
}

pub fn record_to_item(record: &SyncableRecord) -> RecordListItem {
    let now_ms = Utc::now().timestamp_millis();
    RecordListItem {
        id: record.local_id.as_str(),
        server_id: record.server_id.clone(),
        version: record.version,
        status: record.sync_status.to_string(),
        modified_locally: record.modified_locally,
        deleted: record.is_deleted(),
        updated_at: record.updated_at,
        relative_time: format_relative_time(record.updated_at, now_ms),
        payload: record.payload.clone(),
    }
}

pub fn format_record_lines(records: &[SyncableRecord]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    records
        .iter()
        .map(|record| {
            let status = if record.is_deleted() {
                format!("{}*", record.sync_status)
            } else {
                record.sync_status.to_string()
            };
            format!(
                "{:<13}  {status:<9}  v{:<4}  {:<40}  {}",
                short_id(&record.local_id),
                record.version,
                compact_json(&record.payload, 40),
                format_relative_time(record.updated_at, now_ms)
            )
        })
        .collect()
}

pub fn conflict_to_item(conflict: &SyncConflict) -> ConflictItem {
    ConflictItem {
        id: conflict.id,
        entity_type: conflict.entity_type.clone(),
        local_id: conflict.local_id.clone(),
        local_version: conflict.local_version,
        server_version: conflict.server_version,
        detected_at: conflict.detected_at,
        detected_at_iso: format_sync_timestamp(conflict.detected_at),
        resolved: !conflict.is_open(),
        strategy: conflict
            .resolution_strategy
            .map(|strategy| strategy.as_str().to_string()),
        resolved_by: conflict.resolved_by.clone(),
        local_payload: conflict.local_data.payload.clone(),
        server_payload: conflict.server_data.payload.clone(),
    }
}

pub fn format_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let state = conflict
                .resolution_strategy
                .map_or("open", |strategy| strategy.as_str());
            format!(
                "#{:<5} {}  {:<11}  {}/{}  local=v{} server=v{}",
                conflict.id,
                format_sync_timestamp(conflict.detected_at),
                state,
                conflict.entity_type,
                conflict.local_id.chars().take(13).collect::<String>(),
                conflict.local_version,
                conflict.server_version
            )
        })
        .collect()
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}
