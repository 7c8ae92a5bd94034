//! Conflict resolution strategies.
//!
//! `keep_local` and `merge` re-baseline the row on the server's version and
//! leave it `pending` for the next push. `keep_remote` adopts the server copy
//! and leaves the row `synced`. The conflict row is closed but never deleted.

use rusqlite::Connection;

use crate::db::{RecordRepository, SqliteConflictRepository, SqliteRecordRepository};
use crate::entity::EntityRegistry;
use crate::error::{Error, Result};
use crate::models::{LocalId, ResolutionStrategy, SyncConflict, SyncStatus};

/// Where a resolved row ends up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Local content must be pushed again
    Repush,
    /// Row now matches the server
    Synced,
}

impl Resolution {
    pub const fn status(self) -> SyncStatus {
        match self {
            Self::Repush => SyncStatus::Pending,
            Self::Synced => SyncStatus::Synced,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConflictResolver {
    registry: EntityRegistry,
}

impl ConflictResolver {
    pub const fn new(registry: EntityRegistry) -> Self {
        Self { registry }
    }

    /// Apply `strategy` to an open conflict and close it.
    ///
    /// Must run inside the caller's transaction.
    pub fn resolve(
        &self,
        conn: &Connection,
        conflict: &SyncConflict,
        strategy: ResolutionStrategy,
        resolved_by: &str,
        now: i64,
    ) -> Result<Resolution> {
        if !conflict.is_open() {
            return Err(Error::InvalidInput(format!(
                "conflict {} is already resolved",
                conflict.id
            )));
        }
        let local_id: LocalId = conflict.local_id.parse().map_err(|_| {
            Error::InvalidInput(format!("conflict {} has a bad local id", conflict.id))
        })?;
        let records = SqliteRecordRepository::new(conn, &conflict.entity_type)?;
        let local = records
            .get(&local_id)?
            .ok_or_else(|| Error::NotFound(local_id.to_string()))?;

        let resolution = match strategy {
            ResolutionStrategy::KeepLocal => {
                records.rebase_for_push(
                    &local_id,
                    conflict.server_id.as_deref(),
                    conflict.server_version,
                    None,
                    now,
                )?;
                Resolution::Repush
            }
            ResolutionStrategy::Merge => {
                let merged = self.registry.merge(
                    &conflict.entity_type,
                    &local.payload,
                    &conflict.server_data.payload,
                )?;
                records.rebase_for_push(
                    &local_id,
                    conflict.server_id.as_deref(),
                    conflict.server_version,
                    Some(&merged),
                    now,
                )?;
                Resolution::Repush
            }
            ResolutionStrategy::KeepRemote => {
                let server_id = conflict.server_id.as_deref().ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "conflict {} has no server copy to keep",
                        conflict.id
                    ))
                })?;
                records.overwrite_from_remote(
                    &local_id,
                    server_id,
                    &conflict.server_data.payload,
                    conflict.server_data.deleted_at,
                    conflict.server_version.max(local.version),
                    now,
                )?;
                Resolution::Synced
            }
            ResolutionStrategy::Manual => {
                return Err(Error::InvalidInput(
                    "manual leaves the conflict open; pick a concrete strategy".to_string(),
                ))
            }
        };

        SqliteConflictRepository::new(conn).mark_resolved(conflict.id, strategy, resolved_by, now)?;
        tracing::info!(
            conflict_id = conflict.id,
            entity_type = %conflict.entity_type,
            local_id = %conflict.local_id,
            strategy = strategy.as_str(),
            resolved_by,
            "Resolved sync conflict"
        );
        Ok(resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, NewConflict};
    use crate::models::{RecordSnapshot, SyncableRecord};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    struct Fixture {
        db: Database,
        resolver: ConflictResolver,
    }

    impl Fixture {
        fn new() -> Self {
            let db = Database::open_in_memory().unwrap();
            db.register_entity("topic").unwrap();
            let registry = EntityRegistry::from_names(["topic"]).unwrap();
            Self {
                db,
                resolver: ConflictResolver::new(registry),
            }
        }

        fn records(&self) -> SqliteRecordRepository<'_> {
            SqliteRecordRepository::new(self.db.connection(), "topic").unwrap()
        }

        /// A synced row at version 2, edited locally and then rejected by a
        /// server holding version 3.
        fn conflicted(&self, local: Value, remote: Value) -> (SyncableRecord, SyncConflict) {
            let records = self.records();
            let id = records
                .insert_remote("srv-1", &json!({"title": "base"}), None, 2, 10)
                .unwrap();
            let row = records.update(&id, &local).unwrap();
            records.mark_status(&id, SyncStatus::Conflict).unwrap();

            let local_data = RecordSnapshot {
                payload: local,
                deleted_at: None,
            };
            let server_data = RecordSnapshot {
                payload: remote,
                deleted_at: None,
            };
            let conflict = SqliteConflictRepository::new(self.db.connection())
                .record(
                    &NewConflict {
                        entity_type: "topic",
                        local_id: &id.as_str(),
                        server_id: Some("srv-1"),
                        local_version: 2,
                        server_version: 3,
                        local_data: &local_data,
                        server_data: &server_data,
                    },
                    20,
                )
                .unwrap();
            (row, conflict)
        }
    }

    #[test]
    fn keep_local_rebases_on_server_version() {
        let fixture = Fixture::new();
        let (row, conflict) = fixture.conflicted(json!({"title": "mine"}), json!({"title": "theirs"}));

        let resolution = fixture
            .resolver
            .resolve(fixture.db.connection(), &conflict, ResolutionStrategy::KeepLocal, "user", 30)
            .unwrap();
        assert_eq!(resolution, Resolution::Repush);

        let rebased = fixture.records().get(&row.local_id).unwrap().unwrap();
        assert_eq!(rebased.version, 3);
        assert_eq!(rebased.sync_status, resolution.status());
        assert_eq!(rebased.payload, json!({"title": "mine"}));
        assert!(rebased.modified_locally);
        assert!(rebased.local_revision > row.local_revision);
    }

    #[test]
    fn keep_remote_adopts_server_copy() {
        let fixture = Fixture::new();
        let (row, conflict) = fixture.conflicted(json!({"title": "mine"}), json!({"title": "theirs"}));

        let resolution = fixture
            .resolver
            .resolve(fixture.db.connection(), &conflict, ResolutionStrategy::KeepRemote, "user", 30)
            .unwrap();
        assert_eq!(resolution, Resolution::Synced);

        let adopted = fixture.records().get(&row.local_id).unwrap().unwrap();
        assert_eq!(adopted.version, 3);
        assert_eq!(adopted.sync_status, SyncStatus::Synced);
        assert!(!adopted.modified_locally);
        assert_eq!(adopted.payload, json!({"title": "theirs"}));
    }

    #[test]
    fn merge_uses_registry_and_repushes() {
        let fixture = Fixture::new();
        let (row, conflict) = fixture.conflicted(
            json!({"title": "mine"}),
            json!({"title": "theirs", "color": "red"}),
        );

        fixture
            .resolver
            .resolve(fixture.db.connection(), &conflict, ResolutionStrategy::Merge, "auto", 30)
            .unwrap();

        let merged = fixture.records().get(&row.local_id).unwrap().unwrap();
        assert_eq!(merged.payload, json!({"title": "mine", "color": "red"}));
        assert_eq!(merged.sync_status, SyncStatus::Pending);
        assert_eq!(merged.version, 3);
    }

    #[test]
    fn resolution_closes_conflict_once() {
        let fixture = Fixture::new();
        let (_, conflict) = fixture.conflicted(json!({"title": "mine"}), json!({"title": "theirs"}));
        let conflicts = SqliteConflictRepository::new(fixture.db.connection());

        fixture
            .resolver
            .resolve(fixture.db.connection(), &conflict, ResolutionStrategy::KeepLocal, "user", 30)
            .unwrap();
        let closed = conflicts.get(conflict.id).unwrap().unwrap();
        assert_eq!(closed.resolved_at, Some(30));
        assert_eq!(closed.resolved_by.as_deref(), Some("user"));
        assert_eq!(closed.resolution_strategy, Some(ResolutionStrategy::KeepLocal));

        assert!(fixture
            .resolver
            .resolve(fixture.db.connection(), &closed, ResolutionStrategy::KeepRemote, "user", 40)
            .is_err());
    }

    #[test]
    fn manual_is_not_applicable() {
        let fixture = Fixture::new();
        let (_, conflict) = fixture.conflicted(json!({"title": "mine"}), json!({"title": "theirs"}));
        let result = fixture.resolver.resolve(
            fixture.db.connection(),
            &conflict,
            ResolutionStrategy::Manual,
            "user",
            30,
        );
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(SqliteConflictRepository::new(fixture.db.connection())
            .get(conflict.id)
            .unwrap()
            .unwrap()
            .is_open());
    }
}
