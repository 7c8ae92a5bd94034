use std::path::Path;

use tandem_core::models::{ResolutionStrategy, SyncConflict};
use tandem_core::sync::{ConflictResolver, Resolution};
use tandem_core::util::unix_millis_now;
use tandem_core::LocalStore;

use crate::commands::common::{
    conflict_to_item, format_conflict_lines, local_registry, open_store, ConflictItem,
};
use crate::error::CliError;

pub fn run_conflicts_list(
    limit: usize,
    include_resolved: bool,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = open_store(db_path)?;
    let conflicts = store.list_conflicts(limit, !include_resolved)?;

    if as_json {
        let json_items = conflicts
            .iter()
            .map(conflict_to_item)
            .collect::<Vec<ConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

/// Close a conflict offline; a kept local side goes out with the next sync.
pub fn resolve_conflict(
    store: &LocalStore,
    conflict_id: i64,
    strategy: ResolutionStrategy,
) -> Result<(SyncConflict, Resolution), CliError> {
    let conflict = store
        .get_conflict(conflict_id)?
        .ok_or(CliError::ConflictNotFound(conflict_id))?;
    let resolver = ConflictResolver::new(local_registry(store)?);

    let resolution = store.transaction(|tx| {
        resolver.resolve(tx, &conflict, strategy, "user", unix_millis_now())
    })?;
    let resolved = store
        .get_conflict(conflict_id)?
        .ok_or(CliError::ConflictNotFound(conflict_id))?;
    Ok((resolved, resolution))
}

pub fn run_conflicts_resolve(
    conflict_id: i64,
    strategy: ResolutionStrategy,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = open_store(db_path)?;
    let (conflict, resolution) = resolve_conflict(&store, conflict_id, strategy)?;

    match resolution {
        Resolution::Repush => println!(
            "Resolved conflict #{} with {strategy}; {}/{} will be pushed on the next sync",
            conflict.id, conflict.entity_type, conflict.local_id
        ),
        Resolution::Synced => println!(
            "Resolved conflict #{} with {strategy}; {}/{} now matches the server",
            conflict.id, conflict.entity_type, conflict.local_id
        ),
    }
    Ok(())
}
