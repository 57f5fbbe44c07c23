//! Local entity state.

use crate::error::SyncResult;
use parking_lot::RwLock;
use shelfsync_protocol::{EntitySnapshot, EntityType};
use std::collections::BTreeMap;

/// The client's local copy of synced entities.
///
/// The orchestrator writes remote changes here and the resolver applies
/// the chosen side of a conflict.
pub trait LocalStore: Send + Sync {
    /// Returns the local state of an entity.
    fn snapshot(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> SyncResult<Option<EntitySnapshot>>;

    /// Applies a change pulled from the remote store. Deletions remove the entity.
    fn apply_remote(&self, change: &EntitySnapshot) -> SyncResult<()>;

    /// Overwrites an entity with the given state.
    fn apply_snapshot(&self, snapshot: &EntitySnapshot) -> SyncResult<()>;

    /// Removes an entity.
    fn remove(&self, entity_type: EntityType, entity_id: &str) -> SyncResult<()>;
}

/// An in-memory local store.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    entities: RwLock<BTreeMap<(EntityType, String), EntitySnapshot>>,
    remote_applied: RwLock<Vec<EntitySnapshot>>,
}

impl MemoryLocalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entity directly, as an optimistic local write would.
    pub fn put(&self, snapshot: EntitySnapshot) {
        self.entities
            .write()
            .insert((snapshot.entity_type, snapshot.entity_id.clone()), snapshot);
    }

    /// Every remote change applied so far, in order.
    pub fn remote_applied(&self) -> Vec<EntitySnapshot> {
        self.remote_applied.read().clone()
    }

    /// Number of stored entities.
    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    /// Returns true if the store holds no entities.
    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }
}

impl LocalStore for MemoryLocalStore {
    fn snapshot(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> SyncResult<Option<EntitySnapshot>> {
        Ok(self
            .entities
            .read()
            .get(&(entity_type, entity_id.to_string()))
            .cloned())
    }

    fn apply_remote(&self, change: &EntitySnapshot) -> SyncResult<()> {
        self.remote_applied.write().push(change.clone());
        if change.deleted {
            self.remove(change.entity_type, &change.entity_id)
        } else {
            self.apply_snapshot(change)
        }
    }

    fn apply_snapshot(&self, snapshot: &EntitySnapshot) -> SyncResult<()> {
        self.put(snapshot.clone());
        Ok(())
    }

    fn remove(&self, entity_type: EntityType, entity_id: &str) -> SyncResult<()> {
        self.entities
            .write()
            .remove(&(entity_type, entity_id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn remote_deletion_removes() {
        let store = MemoryLocalStore::new();
        let snap = EntitySnapshot::new(EntityType::Comment, "c1", Utc::now())
            .with_field("body", json!("hi"));

        store.apply_remote(&snap).unwrap();
        assert_eq!(store.len(), 1);

        store.apply_remote(&snap.clone().into_deleted()).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.remote_applied().len(), 2);
    }
}
