//! Per-entity ACL cache.
//!
//! ACLs are stored as `Arc<Acl>` snapshots replaced whole on mutation, so a
//! permission walk can hold on to a consistent ACL while the index moves on.
//! The index never contains a vacant ACL (zero entries with inheritance
//! still on); such an ACL is treated as absent.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::debug;

use crate::error::{PermTreeError, PermTreeResult};
use crate::model::{Acl, EntityId, IdentityId};

/// Per-entity ACL map plus the identity sweep used by delete cascades.
#[derive(Default, Debug)]
pub struct AclIndex {
    acls: RwLock<HashMap<EntityId, Arc<Acl>>>,
}

impl AclIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> PermTreeResult<RwLockReadGuard<'_, HashMap<EntityId, Arc<Acl>>>> {
        self.acls
            .read()
            .map_err(|_| PermTreeError::Storage("acl table lock poisoned".into()))
    }

    fn write(&self) -> PermTreeResult<RwLockWriteGuard<'_, HashMap<EntityId, Arc<Acl>>>> {
        self.acls
            .write()
            .map_err(|_| PermTreeError::Storage("acl table lock poisoned".into()))
    }

    /// Returns the ACL snapshot for an entity, if one is cached.
    pub fn get(&self, entity_id: EntityId) -> PermTreeResult<Option<Arc<Acl>>> {
        Ok(self.read()?.get(&entity_id).cloned())
    }

    /// True when the entity carries an explicit ACL.
    pub fn has_acl(&self, entity_id: EntityId) -> PermTreeResult<bool> {
        Ok(self.read()?.contains_key(&entity_id))
    }

    /// Normalizes and stores an ACL, or removes the cached one when the
    /// normalized ACL is vacant. Returns true when the entity's
    /// holds-an-ACL status changed, which is when the nearest-holder index
    /// needs a refresh.
    pub fn set(&self, mut acl: Acl) -> PermTreeResult<bool> {
        acl.normalize();
        let mut acls = self.write()?;
        let had = acls.contains_key(&acl.entity_id);
        if acl.is_vacant() {
            acls.remove(&acl.entity_id);
            debug!("acl for entity {} became vacant, dropped", acl.entity_id);
            return Ok(had);
        }
        let entity_id = acl.entity_id;
        acls.insert(entity_id, Arc::new(acl));
        Ok(!had)
    }

    /// Drops the ACLs of every listed entity (subtree delete sweep).
    pub fn remove_entities(&self, ids: &[EntityId]) -> PermTreeResult<()> {
        let mut acls = self.write()?;
        for id in ids {
            acls.remove(id);
        }
        Ok(())
    }

    /// Removes every entry referencing one of the given identities from
    /// every cached ACL. ACLs that become vacant are dropped. Returns the
    /// ids of entities whose holds-an-ACL status changed.
    pub fn remove_identities(&self, ids: &[IdentityId]) -> PermTreeResult<Vec<EntityId>> {
        let mut acls = self.write()?;
        let mut vacated = Vec::new();
        let entity_ids: Vec<EntityId> = acls.keys().copied().collect();
        for entity_id in entity_ids {
            let Some(current) = acls.get(&entity_id) else {
                continue;
            };
            let mut updated = (**current).clone();
            if !updated.remove_identities(ids) {
                continue;
            }
            if updated.is_vacant() {
                acls.remove(&entity_id);
                vacated.push(entity_id);
            } else {
                acls.insert(entity_id, Arc::new(updated));
            }
        }
        if !vacated.is_empty() {
            debug!("identity sweep vacated acls on entities {:?}", vacated);
        }
        Ok(vacated)
    }

    /// Snapshot of the whole index, for verification and bulk persistence.
    pub fn snapshot(&self) -> PermTreeResult<Vec<Arc<Acl>>> {
        Ok(self.read()?.values().cloned().collect())
    }

    pub fn clear(&self) -> PermTreeResult<()> {
        self.write()?.clear();
        Ok(())
    }

    /// Replaces the whole index from a bulk-loaded ACL list.
    pub fn rebuild(&self, acls: Vec<Acl>) -> PermTreeResult<()> {
        let mut table = self.write()?;
        table.clear();
        for mut acl in acls {
            acl.normalize();
            if !acl.is_vacant() {
                table.insert(acl.entity_id, Arc::new(acl));
            }
        }
        Ok(())
    }
}
