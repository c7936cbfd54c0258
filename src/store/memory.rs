//! In-memory reference implementation of the persistence boundary.
//!
//! A cluster test shares one `MemoryDataStore` between several nodes, the
//! same way production nodes share one database: the store assigns the
//! cluster-wide monotonic activity ids.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use log::debug;
use tokio::sync::Mutex;

use crate::activity::Activity;
use crate::error::PermTreeResult;
use crate::model::{Acl, ActivityId, Entity, EntityId, Group, IdentityId};
use crate::store::{DataStore, StoreSnapshot};

#[derive(Default)]
struct MemoryTables {
    entities: HashMap<EntityId, Entity>,
    acls: HashMap<EntityId, Acl>,
    groups: HashMap<IdentityId, Group>,
    activities: BTreeMap<ActivityId, Activity>,
    locks: HashSet<ActivityId>,
    last_activity_id: ActivityId,
}

/// In-memory [`DataStore`].
#[derive(Default)]
pub struct MemoryDataStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted activities, for tests.
    pub async fn activity_count(&self) -> usize {
        self.tables.lock().await.activities.len()
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn upsert_entity(
        &self,
        id: EntityId,
        parent_id: Option<EntityId>,
        owner_id: IdentityId,
    ) -> PermTreeResult<()> {
        let mut tables = self.tables.lock().await;
        match tables.entities.get_mut(&id) {
            Some(entity) => entity.owner_id = owner_id,
            None => {
                tables.entities.insert(id, Entity::new(id, parent_id, owner_id));
            }
        }
        Ok(())
    }

    async fn delete_entities(&self, ids: &[EntityId]) -> PermTreeResult<()> {
        let mut tables = self.tables.lock().await;
        for id in ids {
            tables.entities.remove(id);
            tables.acls.remove(id);
        }
        Ok(())
    }

    async fn set_entity_owner(&self, id: EntityId, owner_id: IdentityId) -> PermTreeResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(entity) = tables.entities.get_mut(&id) {
            entity.owner_id = owner_id;
        }
        Ok(())
    }

    async fn move_entity(&self, source_id: EntityId, target_id: EntityId) -> PermTreeResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(entity) = tables.entities.get_mut(&source_id) {
            entity.parent_id = Some(target_id);
        }
        Ok(())
    }

    async fn write_acl(&self, acl: &Acl) -> PermTreeResult<()> {
        let mut tables = self.tables.lock().await;
        tables.acls.insert(acl.entity_id, acl.clone());
        Ok(())
    }

    async fn remove_acl(&self, entity_id: EntityId) -> PermTreeResult<()> {
        let mut tables = self.tables.lock().await;
        tables.acls.remove(&entity_id);
        Ok(())
    }

    async fn set_inheritance(&self, entity_id: EntityId, inherits: bool) -> PermTreeResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(entity) = tables.entities.get_mut(&entity_id) {
            entity.is_inherited = inherits;
        }
        if let Some(acl) = tables.acls.get_mut(&entity_id) {
            acl.inherits = inherits;
        }
        Ok(())
    }

    async fn add_group_members(
        &self,
        group_id: IdentityId,
        users: &[IdentityId],
        groups: &[IdentityId],
    ) -> PermTreeResult<()> {
        let mut tables = self.tables.lock().await;
        let group = tables
            .groups
            .entry(group_id)
            .or_insert_with(|| Group::new(group_id));
        group.user_members.extend(users.iter().copied());
        group.group_members.extend(groups.iter().copied());
        for member in groups {
            tables
                .groups
                .entry(*member)
                .or_insert_with(|| Group::new(*member))
                .parent_groups
                .insert(group_id);
        }
        Ok(())
    }

    async fn remove_group_members(
        &self,
        group_id: IdentityId,
        users: &[IdentityId],
        groups: &[IdentityId],
    ) -> PermTreeResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(group) = tables.groups.get_mut(&group_id) {
            for user in users {
                group.user_members.remove(user);
            }
            for member in groups {
                group.group_members.remove(member);
            }
        }
        for member in groups {
            if let Some(child) = tables.groups.get_mut(member) {
                child.parent_groups.remove(&group_id);
            }
        }
        Ok(())
    }

    async fn delete_identities(&self, ids: &[IdentityId]) -> PermTreeResult<()> {
        let mut tables = self.tables.lock().await;
        for id in ids {
            tables.groups.remove(id);
        }
        for group in tables.groups.values_mut() {
            for id in ids {
                group.user_members.remove(id);
                group.group_members.remove(id);
                group.parent_groups.remove(id);
            }
        }
        let entity_ids: Vec<EntityId> = tables.acls.keys().copied().collect();
        for entity_id in entity_ids {
            let Some(acl) = tables.acls.get_mut(&entity_id) else {
                continue;
            };
            if acl.remove_identities(ids) && acl.is_vacant() {
                tables.acls.remove(&entity_id);
            }
        }
        Ok(())
    }

    async fn save_activity(&self, activity: &Activity) -> PermTreeResult<ActivityId> {
        let mut tables = self.tables.lock().await;
        let id = tables.last_activity_id + 1;
        tables.last_activity_id = id;
        let mut stored = activity.clone();
        stored.id = Some(id);
        tables.activities.insert(id, stored);
        debug!("persisted activity {}", id);
        Ok(id)
    }

    async fn load_activities(
        &self,
        from: ActivityId,
        to: ActivityId,
    ) -> PermTreeResult<Vec<Activity>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .activities
            .range(from..=to)
            .map(|(_, activity)| activity.clone())
            .collect())
    }

    async fn load_activities_by_ids(&self, ids: &[ActivityId]) -> PermTreeResult<Vec<Activity>> {
        let tables = self.tables.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.activities.get(id).cloned())
            .collect())
    }

    async fn last_activity_id(&self) -> PermTreeResult<ActivityId> {
        Ok(self.tables.lock().await.last_activity_id)
    }

    async fn acquire_activity_lock(&self, id: ActivityId) -> PermTreeResult<bool> {
        Ok(self.tables.lock().await.locks.insert(id))
    }

    async fn release_activity_lock(&self, id: ActivityId) -> PermTreeResult<()> {
        self.tables.lock().await.locks.remove(&id);
        Ok(())
    }

    async fn load_all(&self) -> PermTreeResult<StoreSnapshot> {
        let tables = self.tables.lock().await;
        Ok(StoreSnapshot {
            entities: tables.entities.values().cloned().collect(),
            acls: tables.acls.values().cloned().collect(),
            groups: tables.groups.values().cloned().collect(),
        })
    }
}
