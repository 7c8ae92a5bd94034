use std::path::Path;

use crate::commands::common::{
    format_record_lines, open_store, record_to_item, resolve_payload, resolve_record,
    RecordListItem,
};
use crate::error::CliError;

pub fn run_add(entity: &str, payload: Option<&str>, db_path: &Path) -> Result<(), CliError> {
    let payload = resolve_payload(payload)?;
    let store = open_store(db_path)?;
    store.register_entity(entity)?;

    let record = store.create_record(entity, &payload)?;
    println!("{}", record.local_id);
    Ok(())
}

pub fn run_update(
    entity: &str,
    id: &str,
    payload: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let payload = resolve_payload(payload)?;
    let store = open_store(db_path)?;
    let record = resolve_record(&store, entity, id)?;

    let updated = store.update_record(entity, &record.local_id, &payload)?;
    println!("{}", updated.local_id);
    Ok(())
}

pub fn run_delete(entity: &str, id: &str, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path)?;
    let record = resolve_record(&store, entity, id)?;

    store.delete_record(entity, &record.local_id)?;
    println!("{}", record.local_id);
    Ok(())
}

pub fn run_list(
    entity: &str,
    limit: usize,
    include_deleted: bool,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = open_store(db_path)?;
    let records = store.list_records(entity, limit, 0, include_deleted)?;

    if as_json {
        let json_items = records
            .iter()
            .map(record_to_item)
            .collect::<Vec<RecordListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    } else if records.is_empty() {
        println!("No {entity} records.");
    } else {
        for line in format_record_lines(&records) {
            println!("{line}");
        }
    }
    Ok(())
}
