//! Syncable entity types.
//!
//! Every feature module describes its rows with a [`SyncEntity`] and works
//! through a typed [`Syncable`] handle. The sync engine itself only ever sees
//! the untyped JSON payloads, and learns about entity types and their merge
//! functions from the [`EntityRegistry`].

use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::db::entity_table_name;
use crate::error::{Error, Result};
use crate::models::{LocalId, SyncableRecord};
use crate::services::LocalStore;

/// A business entity whose rows are synchronized.
pub trait SyncEntity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Entity type name used for local tables and remote paths
    const ENTITY_TYPE: &'static str;

    /// Field-level merge of a local and a remote version.
    ///
    /// `None` means this entity type cannot be merged.
    fn merge(_local: &Self, _remote: &Self) -> Option<Self> {
        None
    }
}

/// Merge function over raw payloads: `(local, remote) -> merged`
pub type MergeFn = Arc<dyn Fn(&Value, &Value) -> Result<Value> + Send + Sync>;

/// Overlay `local` on `remote` field by field; local keys win.
///
/// Non-object payloads fall back to the local value.
pub fn shallow_merge(local: &Value, remote: &Value) -> Value {
    match (local, remote) {
        (Value::Object(local), Value::Object(remote)) => {
            let mut merged = remote.clone();
            for (key, value) in local {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => local.clone(),
    }
}

fn typed_merge<T: SyncEntity>(local: &Value, remote: &Value) -> Result<Value> {
    let local_value: T = serde_json::from_value(local.clone())?;
    let remote_value: T = serde_json::from_value(remote.clone())?;
    let merged = T::merge(&local_value, &remote_value).ok_or_else(|| {
        Error::InvalidInput(format!("{} records cannot be merged", T::ENTITY_TYPE))
    })?;
    Ok(serde_json::to_value(merged)?)
}

struct RegisteredEntity {
    entity_type: String,
    merge: Option<MergeFn>,
}

/// Entity types in dependency order, with their merge functions.
///
/// Parents must be registered before the entities referencing them; a sync
/// cycle visits the types in registration order.
#[derive(Clone, Default)]
pub struct EntityRegistry {
    entities: Vec<Arc<RegisteredEntity>>,
}

impl fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entity_types()).finish()
    }
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed entity, using its `merge` implementation.
    pub fn register<T: SyncEntity>(&mut self) -> Result<&mut Self> {
        let merge: MergeFn = Arc::new(typed_merge::<T>);
        self.insert(T::ENTITY_TYPE, Some(merge))
    }

    /// Register an entity type by name with an optional merge function.
    pub fn register_untyped(
        &mut self,
        entity_type: &str,
        merge: Option<MergeFn>,
    ) -> Result<&mut Self> {
        self.insert(entity_type, merge)
    }

    /// Build a registry from names, merging with [`shallow_merge`].
    pub fn from_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut registry = Self::new();
        let merge: MergeFn = Arc::new(|local, remote| Ok(shallow_merge(local, remote)));
        for name in names {
            registry.insert(name.as_ref(), Some(Arc::clone(&merge)))?;
        }
        Ok(registry)
    }

    fn insert(&mut self, entity_type: &str, merge: Option<MergeFn>) -> Result<&mut Self> {
        entity_table_name(entity_type)?;
        if self.contains(entity_type) {
            return Err(Error::InvalidInput(format!(
                "entity type {entity_type} registered twice"
            )));
        }
        self.entities.push(Arc::new(RegisteredEntity {
            entity_type: entity_type.to_string(),
            merge,
        }));
        Ok(self)
    }

    /// Entity types in dependency order
    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.entities.iter().map(|entity| entity.entity_type.as_str())
    }

    pub fn contains(&self, entity_type: &str) -> bool {
        self.entities
            .iter()
            .any(|entity| entity.entity_type == entity_type)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Merge two payloads of the given entity type.
    pub fn merge(&self, entity_type: &str, local: &Value, remote: &Value) -> Result<Value> {
        let entity = self
            .entities
            .iter()
            .find(|entity| entity.entity_type == entity_type)
            .ok_or_else(|| Error::UnknownEntity(entity_type.to_string()))?;
        let merge = entity.merge.as_ref().ok_or_else(|| {
            Error::InvalidInput(format!("{entity_type} records cannot be merged"))
        })?;
        merge(local, remote)
    }

    /// Create local storage for every registered entity type.
    pub fn install(&self, store: &LocalStore) -> Result<()> {
        let existing: HashSet<String> = store.registered_entities()?.into_iter().collect();
        for entity_type in self.entity_types() {
            if !existing.contains(entity_type) {
                tracing::debug!(entity_type, "Creating local storage");
            }
            store.register_entity(entity_type)?;
        }
        Ok(())
    }
}

/// A typed row: sync metadata plus the decoded entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry<T> {
    pub record: SyncableRecord,
    pub value: T,
}

impl<T: SyncEntity> Entry<T> {
    fn decode(record: SyncableRecord) -> Result<Self> {
        let value = serde_json::from_value(record.payload.clone())?;
        Ok(Self { record, value })
    }

    pub const fn local_id(&self) -> LocalId {
        self.record.local_id
    }
}

/// Typed CRUD facade over the local store for one entity type.
pub struct Syncable<T> {
    store: LocalStore,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for Syncable<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T: SyncEntity> Syncable<T> {
    /// Bind to a store, creating the entity's storage if needed.
    pub fn new(store: LocalStore) -> Result<Self> {
        store.register_entity(T::ENTITY_TYPE)?;
        Ok(Self {
            store,
            _entity: PhantomData,
        })
    }

    pub const fn entity_type(&self) -> &'static str {
        T::ENTITY_TYPE
    }

    pub fn create(&self, value: &T) -> Result<Entry<T>> {
        let payload = serde_json::to_value(value)?;
        Entry::decode(self.store.create_record(T::ENTITY_TYPE, &payload)?)
    }

    pub fn update(&self, id: &LocalId, value: &T) -> Result<Entry<T>> {
        let payload = serde_json::to_value(value)?;
        Entry::decode(self.store.update_record(T::ENTITY_TYPE, id, &payload)?)
    }

    pub fn delete(&self, id: &LocalId) -> Result<Entry<T>> {
        Entry::decode(self.store.delete_record(T::ENTITY_TYPE, id)?)
    }

    pub fn get(&self, id: &LocalId) -> Result<Option<Entry<T>>> {
        self.store
            .get_record(T::ENTITY_TYPE, id)?
            .map(Entry::decode)
            .transpose()
    }

    /// List rows newest-first; tombstones only when `include_deleted`.
    pub fn list(&self, limit: usize, offset: usize, include_deleted: bool) -> Result<Vec<Entry<T>>> {
        self.store
            .list_records(T::ENTITY_TYPE, limit, offset, include_deleted)?
            .into_iter()
            .map(Entry::decode)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SyncStatus;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Topic {
        title: String,
        #[serde(default)]
        tags: Vec<String>,
    }

    impl SyncEntity for Topic {
        const ENTITY_TYPE: &'static str = "topic";

        fn merge(local: &Self, remote: &Self) -> Option<Self> {
            let mut tags = remote.tags.clone();
            for tag in &local.tags {
                if !tags.contains(tag) {
                    tags.push(tag.clone());
                }
            }
            Some(Self {
                title: local.title.clone(),
                tags,
            })
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Session {
        topic: String,
    }

    impl SyncEntity for Session {
        const ENTITY_TYPE: &'static str = "session";
    }

    #[test]
    fn typed_crud_goes_through_change_tracking() {
        let store = LocalStore::open_in_memory().unwrap();
        let topics = Syncable::<Topic>::new(store).unwrap();

        let created = topics
            .create(&Topic {
                title: "Rust".into(),
                tags: vec![],
            })
            .unwrap();
        assert_eq!(created.record.sync_status, SyncStatus::Pending);
        assert_eq!(created.record.version, 1);

        let updated = topics
            .update(
                &created.local_id(),
                &Topic {
                    title: "Rust 2024".into(),
                    tags: vec!["lang".into()],
                },
            )
            .unwrap();
        assert_eq!(updated.value.title, "Rust 2024");
        assert_eq!(updated.record.local_revision, 2);

        topics.delete(&created.local_id()).unwrap();
        assert!(topics.list(10, 0, false).unwrap().is_empty());
        let tombstone = topics.get(&created.local_id()).unwrap().unwrap();
        assert!(tombstone.record.is_deleted());
        assert!(tombstone.record.modified_locally);
    }

    #[test]
    fn registry_keeps_dependency_order() {
        let mut registry = EntityRegistry::new();
        registry
            .register::<Topic>()
            .unwrap()
            .register::<Session>()
            .unwrap();
        assert_eq!(
            registry.entity_types().collect::<Vec<_>>(),
            vec!["topic", "session"]
        );
        assert!(registry.register::<Topic>().is_err());
    }

    #[test]
    fn registry_rejects_invalid_names() {
        let mut registry = EntityRegistry::new();
        assert!(registry.register_untyped("Topic; DROP", None).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn typed_merge_uses_entity_implementation() {
        let mut registry = EntityRegistry::new();
        registry.register::<Topic>().unwrap();

        let merged = registry
            .merge(
                "topic",
                &json!({"title": "mine", "tags": ["a"]}),
                &json!({"title": "theirs", "tags": ["b"]}),
            )
            .unwrap();
        assert_eq!(merged, json!({"title": "mine", "tags": ["b", "a"]}));
    }

    #[test]
    fn entity_without_merge_refuses() {
        let mut registry = EntityRegistry::new();
        registry.register::<Session>().unwrap();
        let result = registry.merge("session", &json!({"topic": "a"}), &json!({"topic": "b"}));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(matches!(
            registry.merge("habit", &json!({}), &json!({})),
            Err(Error::UnknownEntity(_))
        ));
    }

    #[test]
    fn shallow_merge_prefers_local_fields() {
        let merged = shallow_merge(
            &json!({"title": "mine"}),
            &json!({"title": "theirs", "color": "red"}),
        );
        assert_eq!(merged, json!({"title": "mine", "color": "red"}));
        assert_eq!(shallow_merge(&json!(1), &json!({"a": 1})), json!(1));
    }

    #[test]
    fn install_creates_tables_for_names() {
        let store = LocalStore::open_in_memory().unwrap();
        let registry = EntityRegistry::from_names(["topic", "session"]).unwrap();
        registry.install(&store).unwrap();
        assert_eq!(
            store.registered_entities().unwrap(),
            vec!["topic".to_string(), "session".to_string()]
        );
    }
}
