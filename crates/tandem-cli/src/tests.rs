use std::path::PathBuf;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;
use tandem_core::models::{ResolutionStrategy, SyncStatus};
use tandem_core::remote::LoopbackRemote;
use tandem_core::sync::{
    CycleAbort, EntityReport, PhaseCounts, Resolution, SyncManager, SyncOptions, SyncReport,
};
use tandem_core::{EntityRegistry, LocalStore};
use tempfile::TempDir;

use crate::cli::StrategyArg;
use crate::commands::common::{
    compact_json, format_relative_time, format_sync_timestamp, normalize_content,
    normalize_record_identifier, parse_payload, resolve_db_path, resolve_record,
};
use crate::commands::conflicts::resolve_conflict;
use crate::commands::status::collect_status;
use crate::commands::sync::format_report_lines;
use crate::error::CliError;

fn temp_store() -> (TempDir, LocalStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::open_path(dir.path().join("tandem.db")).unwrap();
    store.register_entity("topic").unwrap();
    (dir, store)
}

fn manager_at(dir: &TempDir, name: &str, remote: LoopbackRemote) -> SyncManager {
    let store = LocalStore::open_path(dir.path().join(name)).unwrap();
    let registry = EntityRegistry::from_names(["topic"]).unwrap();
    SyncManager::new(store, Arc::new(remote), registry, SyncOptions::default()).unwrap()
}

#[test]
fn normalize_content_trims_and_rejects_empty() {
    assert_eq!(normalize_content("  {}  "), Some("{}".to_string()));
    assert_eq!(normalize_content(" \n\t "), None);
}

#[test]
fn payload_must_be_a_json_object() {
    assert_eq!(
        parse_payload(r#"{"title": "hi"}"#).unwrap(),
        json!({"title": "hi"})
    );
    assert!(matches!(
        parse_payload("[1, 2]"),
        Err(CliError::InvalidPayload(_))
    ));
    assert!(matches!(
        parse_payload("not json"),
        Err(CliError::InvalidPayload(_))
    ));
}

#[test]
fn record_identifier_is_trimmed_and_lowercased() {
    assert_eq!(
        normalize_record_identifier("  01ABC ").unwrap(),
        "01abc".to_string()
    );
    assert!(matches!(
        normalize_record_identifier("   "),
        Err(CliError::EmptyRecordId)
    ));
}

#[test]
fn explicit_db_path_wins() {
    let path = PathBuf::from("/tmp/explicit.db");
    assert_eq!(resolve_db_path(Some(path.clone())).unwrap(), path);
}

#[test]
fn compact_json_truncates_long_payloads() {
    let value = json!({"title": "a very long title that keeps going"});
    let preview = compact_json(&value, 20);
    assert_eq!(preview.chars().count(), 20);
    assert!(preview.ends_with("..."));
    assert_eq!(compact_json(&json!({}), 20), "{}");
}

#[test]
fn relative_time_buckets() {
    let now = 10_000_000_000;
    assert_eq!(format_relative_time(now - 5_000, now), "just now");
    assert_eq!(format_relative_time(now - 5 * 60_000, now), "5m ago");
    assert_eq!(format_relative_time(now - 3 * 3_600_000, now), "3h ago");
    assert_eq!(format_relative_time(now - 2 * 86_400_000, now), "2d ago");
    assert_eq!(format_relative_time(now - 14 * 86_400_000, now), "2w ago");
    assert_eq!(format_relative_time(now - 400 * 86_400_000, now), "1y ago");
}

#[test]
fn sync_timestamp_is_utc() {
    assert_eq!(format_sync_timestamp(0), "1970-01-01 00:00:00 UTC");
}

#[test]
fn strategy_arg_maps_to_core_strategy() {
    assert_eq!(
        ResolutionStrategy::from(StrategyArg::KeepRemote),
        ResolutionStrategy::KeepRemote
    );
    assert_eq!(
        ResolutionStrategy::from(StrategyArg::Merge),
        ResolutionStrategy::Merge
    );
}

#[test]
fn resolve_record_accepts_full_id_and_unique_prefix() {
    let (_dir, store) = temp_store();
    let first = store.create_record("topic", &json!({"n": 1})).unwrap();
    let second = store.create_record("topic", &json!({"n": 2})).unwrap();

    let full = first.local_id.as_str();
    let by_full = resolve_record(&store, "topic", &full.to_ascii_uppercase()).unwrap();
    assert_eq!(by_full.local_id, first.local_id);

    let second_id = second.local_id.as_str();
    let by_prefix = resolve_record(&store, "topic", &second_id[..32]).unwrap();
    assert_eq!(by_prefix.local_id, second.local_id);
}

#[test]
fn resolve_record_rejects_ambiguous_and_unknown_prefixes() {
    let (_dir, store) = temp_store();
    let first = store.create_record("topic", &json!({"n": 1})).unwrap();
    let second = store.create_record("topic", &json!({"n": 2})).unwrap();

    let first_id = first.local_id.as_str();
    let second_id = second.local_id.as_str();
    let shared: String = first_id
        .chars()
        .zip(second_id.chars())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a)
        .collect();
    assert!(!shared.is_empty());

    assert!(matches!(
        resolve_record(&store, "topic", &shared),
        Err(CliError::AmbiguousRecordId(_))
    ));
    assert!(matches!(
        resolve_record(&store, "topic", "zzzz"),
        Err(CliError::RecordNotFound(_))
    ));
}

#[test]
fn deleted_records_are_still_resolvable() {
    let (_dir, store) = temp_store();
    let record = store.create_record("topic", &json!({"n": 1})).unwrap();
    store.delete_record("topic", &record.local_id).unwrap();

    let found = resolve_record(&store, "topic", &record.local_id.as_str()).unwrap();
    assert!(found.is_deleted());
}

#[test]
fn status_counts_pending_rows() {
    let (_dir, store) = temp_store();
    store.create_record("topic", &json!({"n": 1})).unwrap();
    store.create_record("topic", &json!({"n": 2})).unwrap();

    let status = collect_status(&store).unwrap();
    assert_eq!(status.entities.len(), 1);
    assert_eq!(status.entities[0].entity_type, "topic");
    assert_eq!(status.entities[0].counts.pending, 2);
    assert_eq!(status.entities[0].last_pull_timestamp, None);
    assert_eq!(status.last_cycle_error, None);
}

#[test]
fn report_lines_explain_an_abort() {
    let report = SyncReport {
        entities: vec![EntityReport {
            entity_type: "topic".to_string(),
            push: PhaseCounts {
                applied: 1,
                ..PhaseCounts::default()
            },
            ..EntityReport::default()
        }],
        aborted: Some(CycleAbort {
            entity_type: "session".to_string(),
            message: "credential rejected".to_string(),
            auth_required: true,
            skipped: vec!["comment".to_string()],
        }),
        started_at: 0,
        finished_at: 0,
    };

    let lines = format_report_lines(&report);
    assert!(lines[0].starts_with("topic"));
    assert_eq!(lines[1], "Stopped at session: credential rejected");
    assert_eq!(lines[2], "Not visited: comment");
    assert_eq!(lines[3], "Check TANDEM_API_TOKEN and try again");
}

async fn conflicted_pair(dir: &TempDir) -> (SyncManager, SyncManager) {
    let remote_a = LoopbackRemote::standalone();
    let remote_b = LoopbackRemote::new(Arc::clone(remote_a.authority()));
    let a = manager_at(dir, "a.db", remote_a);
    let b = manager_at(dir, "b.db", remote_b);

    let id_a = a
        .store()
        .create_record("topic", &json!({"title": "draft"}))
        .unwrap()
        .local_id;
    a.run_cycle().await.unwrap();
    b.run_cycle().await.unwrap();

    a.store()
        .update_record("topic", &id_a, &json!({"title": "from a"}))
        .unwrap();
    a.run_cycle().await.unwrap();

    let id_b = b.store().list_records("topic", 10, 0, false).unwrap()[0].local_id;
    b.store()
        .update_record("topic", &id_b, &json!({"title": "from b"}))
        .unwrap();
    let report = b.run_cycle().await.unwrap();
    assert!(report.conflicts() >= 1);
    assert_eq!(b.store().list_conflicts(10, true).unwrap().len(), 1);
    (a, b)
}

#[tokio::test(flavor = "multi_thread")]
async fn keep_remote_settles_conflict_offline() {
    let dir = tempfile::tempdir().unwrap();
    let (_a, b) = conflicted_pair(&dir).await;
    let conflict_id = b.store().list_conflicts(10, true).unwrap()[0].id;

    let (conflict, resolution) =
        resolve_conflict(b.store(), conflict_id, ResolutionStrategy::KeepRemote).unwrap();
    assert_eq!(resolution, Resolution::Synced);
    assert_eq!(conflict.resolution_strategy, Some(ResolutionStrategy::KeepRemote));
    assert_eq!(conflict.resolved_by.as_deref(), Some("user"));

    let row = b.store().list_records("topic", 10, 0, false).unwrap().remove(0);
    assert_eq!(row.payload, json!({"title": "from a"}));
    assert_eq!(row.sync_status, SyncStatus::Synced);
    assert!(b.store().list_conflicts(10, true).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn keep_local_goes_out_with_next_sync() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = conflicted_pair(&dir).await;
    let conflict_id = b.store().list_conflicts(10, true).unwrap()[0].id;

    let (_, resolution) =
        resolve_conflict(b.store(), conflict_id, ResolutionStrategy::KeepLocal).unwrap();
    assert_eq!(resolution, Resolution::Repush);

    let report = b.run_cycle().await.unwrap();
    assert_eq!(report.pushed(), 1);
    assert_eq!(report.conflicts(), 0);

    a.run_cycle().await.unwrap();
    let row = a.store().list_records("topic", 10, 0, false).unwrap().remove(0);
    assert_eq!(row.payload, json!({"title": "from b"}));
}

#[tokio::test(flavor = "multi_thread")]
async fn resolving_twice_or_unknown_ids_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (_a, b) = conflicted_pair(&dir).await;
    let conflict_id = b.store().list_conflicts(10, true).unwrap()[0].id;

    resolve_conflict(b.store(), conflict_id, ResolutionStrategy::Merge).unwrap();
    assert!(matches!(
        resolve_conflict(b.store(), conflict_id, ResolutionStrategy::KeepLocal),
        Err(CliError::Core(_))
    ));
    assert!(matches!(
        resolve_conflict(b.store(), 9_999, ResolutionStrategy::KeepLocal),
        Err(CliError::ConflictNotFound(9_999))
    ));
}
