use std::path::Path;

use serde::Serialize;
use tandem_core::models::{SyncCounts, SyncMetadata, GLOBAL_METADATA_KEY};
use tandem_core::LocalStore;

use crate::commands::common::{format_sync_timestamp, open_store};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct EntityStatus {
    pub entity_type: String,
    #[serde(flatten)]
    pub counts: SyncCounts,
    pub last_pull_timestamp: Option<i64>,
    pub last_push_timestamp: Option<i64>,
    pub last_error_message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub entities: Vec<EntityStatus>,
    /// Failure that stopped the last cycle before it reached any entity type
    pub last_cycle_error: Option<String>,
}

pub fn collect_status(store: &LocalStore) -> Result<StatusReport, CliError> {
    let metadata = store.list_metadata()?;
    let metadata_for = |entity_type: &str| {
        metadata
            .iter()
            .find(|row| row.entity_type == entity_type)
            .cloned()
            .unwrap_or_default()
    };

    let entities = store
        .registered_entities()?
        .into_iter()
        .map(|entity_type| {
            let counts = store.counts(&entity_type)?;
            let SyncMetadata {
                last_pull_timestamp,
                last_push_timestamp,
                last_error_message,
                ..
            } = metadata_for(&entity_type);
            Ok::<_, CliError>(EntityStatus {
                entity_type,
                counts,
                last_pull_timestamp,
                last_push_timestamp,
                last_error_message,
            })
        })
        .collect::<Result<Vec<_>, CliError>>()?;

    Ok(StatusReport {
        entities,
        last_cycle_error: metadata_for(GLOBAL_METADATA_KEY).last_error_message,
    })
}

pub fn run_status(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path)?;
    let status = collect_status(&store)?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    if status.entities.is_empty() {
        println!("No entity types stored yet.");
    }
    for entity in &status.entities {
        let counts = entity.counts;
        println!(
            "{:<16} pending {:>3}  synced {:>4}  conflict {:>2}  error {:>2}  open conflicts {:>2}",
            entity.entity_type,
            counts.pending,
            counts.synced,
            counts.conflict,
            counts.error,
            counts.open_conflicts
        );
        let last_pull = entity
            .last_pull_timestamp
            .map_or_else(|| "never".to_string(), format_sync_timestamp);
        println!("{:<16} last pull {last_pull}", "");
        if let Some(error) = &entity.last_error_message {
            println!("{:<16} last error {error}", "");
        }
    }
    if let Some(error) = &status.last_cycle_error {
        println!("Last cycle error: {error}");
    }
    Ok(())
}
