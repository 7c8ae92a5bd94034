//! Authoritative record store enforcing the version protocol.
//!
//! A write carrying `version >= stored` is accepted and the stored version
//! becomes `max(stored, incoming) + 1`; an older version is rejected with the
//! current server copy. For a client holding the current version this is
//! plain `stored + 1`. A client ahead of the server (for example after the
//! server lost data) still gets a version above the one it sent, so its own
//! row never moves backwards. Every accepted write is stamped with a tick of a
//! strictly increasing millisecond clock, which is what pull watermarks are
//! compared against.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

use super::wire::{
    BulkSyncRequest, BulkSyncResponse, ChangesResponse, ItemResult, PushItem, RemoteItem,
    WriteAccepted, WriteOutcome,
};
use crate::db::entity_table_name;
use crate::error::{Error, Result};
use crate::util::unix_millis_now;

#[derive(Default)]
struct EntityItems {
    items: HashMap<String, RemoteItem>,
    /// Creating client's `local_id` -> `server_id`
    by_origin: HashMap<String, String>,
}

#[derive(Default)]
struct AuthorityState {
    last_tick: i64,
    entities: HashMap<String, EntityItems>,
}

enum Applied {
    Accepted(RemoteItem),
    Conflict(RemoteItem),
}

fn next_tick(last_tick: &mut i64) -> i64 {
    let tick = unix_millis_now().max(*last_tick + 1);
    *last_tick = tick;
    tick
}

fn validate_item(item: &PushItem) -> std::result::Result<(), String> {
    if item.local_id.trim().is_empty() {
        return Err("local_id must not be empty".to_string());
    }
    if item.version < 1 {
        return Err(format!("version must be at least 1, got {}", item.version));
    }
    if !item.payload.is_object() {
        return Err("payload must be a JSON object".to_string());
    }
    Ok(())
}

fn validate_entity_type(entity_type: &str) -> Result<()> {
    entity_table_name(entity_type)
        .map(|_| ())
        .map_err(|_| Error::Validation(format!("invalid entity type: {entity_type}")))
}

/// In-memory authoritative store shared by the reference server and tests
#[derive(Default)]
pub struct Authority {
    state: Mutex<AuthorityState>,
}

impl Authority {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, AuthorityState>> {
        self.state
            .lock()
            .map_err(|_| Error::Server("authority state lock poisoned".to_string()))
    }

    fn apply(
        state: &mut AuthorityState,
        entity_type: &str,
        item: &PushItem,
    ) -> std::result::Result<Applied, String> {
        validate_item(item)?;
        let AuthorityState {
            last_tick,
            entities,
        } = state;
        let entity = entities.entry(entity_type.to_string()).or_default();

        let target = match &item.server_id {
            Some(server_id) if entity.items.contains_key(server_id) => Some(server_id.clone()),
            Some(server_id) => return Err(format!("unknown server_id {server_id}")),
            None => entity.by_origin.get(&item.local_id).cloned(),
        };

        let Some(stored) = target.and_then(|server_id| entity.items.get_mut(&server_id)) else {
            let created = RemoteItem {
                server_id: Uuid::now_v7().to_string(),
                local_id: Some(item.local_id.clone()),
                version: item.version,
                payload: item.payload.clone(),
                deleted_at: item.deleted_at,
                updated_at: next_tick(last_tick),
            };
            entity
                .by_origin
                .insert(item.local_id.clone(), created.server_id.clone());
            entity
                .items
                .insert(created.server_id.clone(), created.clone());
            return Ok(Applied::Accepted(created));
        };

        if item.version < stored.version {
            return Ok(Applied::Conflict(stored.clone()));
        }
        stored.version = stored.version.max(item.version) + 1;
        stored.payload = item.payload.clone();
        stored.deleted_at = item.deleted_at;
        stored.updated_at = next_tick(last_tick);
        Ok(Applied::Accepted(stored.clone()))
    }

    /// Apply a batch; each item succeeds or fails on its own.
    pub fn bulk_sync(
        &self,
        entity_type: &str,
        request: &BulkSyncRequest,
    ) -> Result<BulkSyncResponse> {
        validate_entity_type(entity_type)?;
        let mut state = self.lock()?;
        let results: Vec<ItemResult> = request
            .items
            .iter()
            .map(|item| match Self::apply(&mut state, entity_type, item) {
                Ok(Applied::Accepted(stored)) => ItemResult::Success {
                    local_id: item.local_id.clone(),
                    server_id: stored.server_id,
                    version: stored.version,
                },
                Ok(Applied::Conflict(stored)) => ItemResult::Conflict {
                    local_id: item.local_id.clone(),
                    server_version: stored.version,
                    server_data: stored,
                },
                Err(error) => ItemResult::Error {
                    local_id: item.local_id.clone(),
                    error,
                },
            })
            .collect();
        Ok(BulkSyncResponse::from_results(results, state.last_tick))
    }

    /// Single-record upsert
    pub fn upsert(&self, entity_type: &str, item: &PushItem) -> Result<WriteOutcome> {
        validate_entity_type(entity_type)?;
        let mut state = self.lock()?;
        match Self::apply(&mut state, entity_type, item).map_err(Error::Validation)? {
            Applied::Accepted(stored) => Ok(WriteOutcome::Accepted(WriteAccepted {
                server_id: stored.server_id,
                version: stored.version,
            })),
            Applied::Conflict(stored) => Ok(WriteOutcome::Conflict {
                server_version: stored.version,
                server_data: stored,
            }),
        }
    }

    /// Soft-delete a record known by its server id.
    pub fn delete(&self, entity_type: &str, server_id: &str, version: i64) -> Result<WriteOutcome> {
        validate_entity_type(entity_type)?;
        let mut state = self.lock()?;
        let AuthorityState {
            last_tick,
            entities,
        } = &mut *state;
        let stored = entities
            .get_mut(entity_type)
            .and_then(|entity| entity.items.get_mut(server_id))
            .ok_or_else(|| Error::NotFound(format!("{entity_type} {server_id}")))?;

        if version < stored.version {
            return Ok(WriteOutcome::Conflict {
                server_version: stored.version,
                server_data: stored.clone(),
            });
        }
        let tick = next_tick(last_tick);
        stored.version = stored.version.max(version) + 1;
        stored.deleted_at = stored.deleted_at.or(Some(tick));
        stored.updated_at = tick;
        Ok(WriteOutcome::Accepted(WriteAccepted {
            server_id: stored.server_id.clone(),
            version: stored.version,
        }))
    }

    /// Records written after `since`, oldest first, at most `limit` of them.
    pub fn changes_since(
        &self,
        entity_type: &str,
        since: Option<i64>,
        limit: usize,
    ) -> Result<ChangesResponse> {
        validate_entity_type(entity_type)?;
        let state = self.lock()?;
        let since = since.unwrap_or(i64::MIN);
        let mut items: Vec<RemoteItem> = state
            .entities
            .get(entity_type)
            .map(|entity| {
                entity
                    .items
                    .values()
                    .filter(|item| item.updated_at > since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        items.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.server_id.cmp(&b.server_id))
        });

        let limit = limit.max(1);
        let has_more = items.len() > limit;
        items.truncate(limit);
        Ok(ChangesResponse {
            items,
            server_timestamp: state.last_tick,
            has_more,
        })
    }

    /// Current server copy of a record
    pub fn get(&self, entity_type: &str, server_id: &str) -> Result<Option<RemoteItem>> {
        let state = self.lock()?;
        Ok(state
            .entities
            .get(entity_type)
            .and_then(|entity| entity.items.get(server_id))
            .cloned())
    }
}
