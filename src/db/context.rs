//! The in-memory kernel context.
//!
//! `PermDb` is the one explicitly constructed object holding the entity
//! tree, the ACL index and the membership cache. Every operation and every
//! activity receives it by handle; nothing in the crate keeps ambient
//! global state. Mutations that span more than one store (a subtree delete
//! sweeping ACLs, an identity delete cascading into entries) are
//! coordinated here.

use std::collections::BTreeSet;

use log::info;

use crate::db::acl_index::AclIndex;
use crate::db::entity_store::EntityStore;
use crate::db::membership::MembershipCache;
use crate::error::{PermTreeError, PermTreeResult};
use crate::model::{Acl, Entity, EntityId, Group, IdentityId};

/// The three in-memory stores behind one handle.
#[derive(Default, Debug)]
pub struct PermDb {
    entities: EntityStore,
    acls: AclIndex,
    membership: MembershipCache,
}

impl PermDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entities(&self) -> &EntityStore {
        &self.entities
    }

    pub fn acls(&self) -> &AclIndex {
        &self.acls
    }

    pub fn membership(&self) -> &MembershipCache {
        &self.membership
    }

    /// Creates an entity. See [`EntityStore::create`] for the validation
    /// rules.
    pub fn create_entity(
        &self,
        id: EntityId,
        parent_id: Option<EntityId>,
        owner_id: IdentityId,
    ) -> PermTreeResult<()> {
        self.entities.create(id, parent_id, owner_id)
    }

    /// Removes an entity with its whole subtree and every ACL referencing a
    /// removed id. Deleting a missing entity is a successful no-op.
    pub fn delete_entity(&self, id: EntityId) -> PermTreeResult<Vec<EntityId>> {
        let removed = self.entities.delete(id)?;
        if !removed.is_empty() {
            self.acls.remove_entities(&removed)?;
        }
        Ok(removed)
    }

    /// Reparents `source` under `target`; the moved subtree's levels and
    /// nearest-holder index follow the new ancestor chain.
    pub fn move_entity(&self, source: EntityId, target: EntityId) -> PermTreeResult<()> {
        self.entities
            .move_entity(source, target, &|id| self.holds_acl(id))
    }

    pub fn modify_owner(&self, id: EntityId, owner_id: IdentityId) -> PermTreeResult<()> {
        self.entities.modify_owner(id, owner_id)
    }

    /// Flips the inheritance flag of an entity; a no-op when the flag
    /// already has the requested value. The flag is mirrored into the
    /// cached ACL before the holder index refresh, so an ACL that becomes
    /// vacant on unbreak stops counting as a holder.
    pub fn set_inheritance(&self, id: EntityId, is_inherited: bool) -> PermTreeResult<()> {
        let entity = self
            .entities
            .get(id)?
            .ok_or(PermTreeError::EntityNotFound(id))?;
        if entity.is_inherited == is_inherited {
            return Ok(());
        }
        if let Some(acl) = self.acls.get(id)? {
            let mut updated = (*acl).clone();
            updated.inherits = is_inherited;
            self.acls.set(updated)?;
        }
        self.entities
            .set_inheritance(id, is_inherited, &|eid| self.holds_acl(eid))?;
        Ok(())
    }

    /// Replaces one entity's ACL wholesale. A vacant ACL clears the cached
    /// one. The subtree's nearest-holder index is refreshed when the
    /// entity's holder status changed.
    pub fn set_acl(&self, acl: Acl) -> PermTreeResult<()> {
        let entity_id = acl.entity_id;
        let holder_changed = self.acls.set(acl)?;
        if holder_changed {
            self.entities
                .refresh_holders(entity_id, &|id| self.holds_acl(id))?;
        }
        Ok(())
    }

    /// Removes identities everywhere: their ACL entries on every entity and
    /// their nodes/edges in the membership graph. Entities whose ACL
    /// vacated get their subtree holder index refreshed.
    pub fn remove_identities(&self, ids: &[IdentityId]) -> PermTreeResult<()> {
        let vacated = self.acls.remove_identities(ids)?;
        self.membership.delete_identities(ids)?;
        for entity_id in vacated {
            self.entities
                .refresh_holders(entity_id, &|id| self.holds_acl(id))?;
        }
        Ok(())
    }

    /// True when the entity carries an explicit ACL, i.e. is an ACL holder
    /// for the nearest-holder index (break boundaries count separately).
    pub fn holds_acl(&self, id: EntityId) -> bool {
        self.acls.has_acl(id).unwrap_or(false)
    }

    /// The user's transitive static groups.
    pub fn groups_of(&self, user_id: IdentityId) -> PermTreeResult<BTreeSet<IdentityId>> {
        self.membership.groups_of(user_id)
    }

    /// Discards all three stores.
    pub fn clear(&self) -> PermTreeResult<()> {
        self.entities.clear()?;
        self.acls.clear()?;
        self.membership.clear()?;
        Ok(())
    }

    /// Discards and rebuilds all three stores from a bulk snapshot, used
    /// for cold start and cache reload.
    pub fn load(
        &self,
        entities: Vec<Entity>,
        acls: Vec<Acl>,
        groups: Vec<Group>,
    ) -> PermTreeResult<()> {
        info!(
            "loading kernel state: {} entities, {} acls, {} groups",
            entities.len(),
            acls.len(),
            groups.len()
        );
        self.acls.rebuild(acls)?;
        self.entities.rebuild(entities, &|id| self.holds_acl(id))?;
        self.membership.rebuild(groups)?;
        Ok(())
    }
}
