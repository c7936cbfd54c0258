//! Batching ACL editor.
//!
//! Accumulates permission edits and inheritance changes against a working
//! copy, then turns the whole batch into a single set-acl activity. The
//! working copy is loaded lazily per entity from the cached ACL, repeated
//! edits for the same (entity, identity, local-only) key merge, and entries
//! whose merged masks are both zero are dropped before submission, so a
//! zero-bitmask entry is never persisted or cached.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::debug;

use crate::activity::{ActivityBody, SetAclPayload};
use crate::db::PermDb;
use crate::error::{PermTreeError, PermTreeResult};
use crate::model::{Acl, AclEntry, EntityId, EntryKey, EntryKind, IdentityId};
use crate::permissions::evaluator::PermissionEvaluator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InheritanceChange {
    Break,
    Unbreak,
}

#[derive(Debug)]
struct WorkingAcl {
    entries: BTreeMap<EntryKey, AclEntry>,
}

/// Accumulates a batch of ACL and inheritance edits and emits one atomic
/// [`ActivityBody::SetAcl`].
#[derive(Debug)]
pub struct AclEditor {
    db: Arc<PermDb>,
    evaluator: PermissionEvaluator,
    working: HashMap<EntityId, WorkingAcl>,
    inheritance: BTreeMap<EntityId, InheritanceChange>,
}

impl AclEditor {
    pub fn new(db: Arc<PermDb>) -> Self {
        let evaluator = PermissionEvaluator::new(Arc::clone(&db));
        Self {
            db,
            evaluator,
            working: HashMap::new(),
            inheritance: BTreeMap::new(),
        }
    }

    /// Grants bits to an identity. Granting clears the same bits from the
    /// entry's deny mask; the later call wins per bit.
    pub fn allow(
        &mut self,
        entity_id: EntityId,
        identity_id: IdentityId,
        local_only: bool,
        bits: u64,
    ) -> PermTreeResult<&mut Self> {
        let entry = self.entry_mut(entity_id, identity_id, local_only)?;
        entry.allow |= bits;
        entry.deny &= !bits;
        Ok(self)
    }

    /// Denies bits to an identity. Denying clears the same bits from the
    /// entry's allow mask.
    pub fn deny(
        &mut self,
        entity_id: EntityId,
        identity_id: IdentityId,
        local_only: bool,
        bits: u64,
    ) -> PermTreeResult<&mut Self> {
        let entry = self.entry_mut(entity_id, identity_id, local_only)?;
        entry.deny |= bits;
        entry.allow &= !bits;
        Ok(self)
    }

    /// Zeroes both masks for the given bits.
    pub fn clear(
        &mut self,
        entity_id: EntityId,
        identity_id: IdentityId,
        local_only: bool,
        bits: u64,
    ) -> PermTreeResult<&mut Self> {
        let entry = self.entry_mut(entity_id, identity_id, local_only)?;
        entry.allow &= !bits;
        entry.deny &= !bits;
        Ok(self)
    }

    /// Replaces both masks wholesale.
    pub fn set(
        &mut self,
        entity_id: EntityId,
        identity_id: IdentityId,
        local_only: bool,
        allow: u64,
        deny: u64,
    ) -> PermTreeResult<&mut Self> {
        let entry = self.entry_mut(entity_id, identity_id, local_only)?;
        entry.allow = allow;
        entry.deny = deny;
        Ok(self)
    }

    /// Clears the entry completely, then reapplies the given baseline,
    /// discarding whatever earlier calls in this batch did to the key.
    pub fn reset(
        &mut self,
        entity_id: EntityId,
        identity_id: IdentityId,
        local_only: bool,
        allow: u64,
        deny: u64,
    ) -> PermTreeResult<&mut Self> {
        let entry = self.entry_mut(entity_id, identity_id, local_only)?;
        entry.allow = allow;
        entry.deny = deny & !allow;
        Ok(self)
    }

    /// Replaces the entity's working copy with an empty entry list.
    pub fn clear_acl(&mut self, entity_id: EntityId) -> PermTreeResult<&mut Self> {
        self.ensure_entity(entity_id)?;
        self.working
            .insert(entity_id, WorkingAcl { entries: BTreeMap::new() });
        Ok(self)
    }

    /// Marks the entity to stop inheriting ancestor entries. The entity's
    /// explicit entries are left alone; combine with
    /// [`Self::copy_effective_permissions`] to keep behavior unchanged, or
    /// with [`Self::clear_acl`] to cut everything.
    pub fn break_inheritance(&mut self, entity_id: EntityId) -> PermTreeResult<&mut Self> {
        self.ensure_entity(entity_id)?;
        self.inheritance.insert(entity_id, InheritanceChange::Break);
        Ok(self)
    }

    /// Marks the entity to resume inheriting ancestor entries.
    pub fn unbreak_inheritance(&mut self, entity_id: EntityId) -> PermTreeResult<&mut Self> {
        self.ensure_entity(entity_id)?;
        self.inheritance.insert(entity_id, InheritanceChange::Unbreak);
        Ok(self)
    }

    /// Replaces the entity's working copy with its currently effective
    /// permissions, materialized as explicit entries. Breaking inheritance
    /// right after leaves every check at and below the entity unchanged.
    pub fn copy_effective_permissions(&mut self, entity_id: EntityId) -> PermTreeResult<&mut Self> {
        let materialized = self.evaluator.materialized_entries(entity_id)?;
        debug!(
            "materialized {} effective entries on entity {}",
            materialized.len(),
            entity_id
        );
        let mut entries = BTreeMap::new();
        for entry in materialized {
            entries.insert(entry.key(), entry);
        }
        self.working.insert(entity_id, WorkingAcl { entries });
        Ok(self)
    }

    /// Removes explicit propagating entries that are bit-for-bit redundant
    /// with what inheritance alone would produce at the entity. Typically
    /// combined with [`Self::unbreak_inheritance`]; if the ACL becomes
    /// empty it is dropped entirely on apply.
    pub fn normalize_explicit_permissions(
        &mut self,
        entity_id: EntityId,
    ) -> PermTreeResult<&mut Self> {
        let inherited = self.evaluator.inherited_view(entity_id)?;
        let working = self.working_mut(entity_id)?;
        working.entries.retain(|_, entry| {
            if entry.local_only || entry.kind != EntryKind::Normal {
                return true;
            }
            match inherited.get(&entry.identity_id) {
                Some((allow, deny)) => {
                    let redundant =
                        entry.allow & !allow == 0 && entry.deny & !deny == 0;
                    !redundant
                }
                None => true,
            }
        });
        Ok(self)
    }

    /// True when the batch carries no edits at all.
    pub fn is_empty(&self) -> bool {
        self.working.is_empty() && self.inheritance.is_empty()
    }

    /// Turns the batch into a single set-acl activity body. Entries whose
    /// merged allow and deny masks are both zero are dropped.
    pub fn build(self) -> PermTreeResult<ActivityBody> {
        if self.is_empty() {
            return Err(PermTreeError::InvalidArgument(
                "acl batch contains no edits".into(),
            ));
        }

        let mut acls = Vec::new();
        let mut breaks = Vec::new();
        let mut unbreaks = Vec::new();
        for (entity_id, change) in &self.inheritance {
            match change {
                InheritanceChange::Break => breaks.push(*entity_id),
                InheritanceChange::Unbreak => unbreaks.push(*entity_id),
            }
        }

        for (entity_id, working) in self.working {
            let inherits = match self.inheritance.get(&entity_id) {
                Some(InheritanceChange::Break) => false,
                Some(InheritanceChange::Unbreak) => true,
                None => self
                    .db
                    .entities()
                    .get(entity_id)?
                    .map(|e| e.is_inherited)
                    .unwrap_or(true),
            };
            let mut acl = Acl {
                entity_id,
                inherits,
                entries: working.entries.into_values().collect(),
            };
            acl.normalize();
            acls.push(acl);
        }
        acls.sort_by_key(|acl| acl.entity_id);

        Ok(ActivityBody::SetAcl(SetAclPayload {
            acls,
            breaks,
            unbreaks,
        }))
    }

    fn ensure_entity(&self, entity_id: EntityId) -> PermTreeResult<()> {
        if entity_id == 0 {
            return Err(PermTreeError::InvalidArgument(
                "entity id must not be zero".into(),
            ));
        }
        if self.db.entities().get(entity_id)?.is_none() {
            return Err(PermTreeError::EntityNotFound(entity_id));
        }
        Ok(())
    }

    fn working_mut(&mut self, entity_id: EntityId) -> PermTreeResult<&mut WorkingAcl> {
        self.ensure_entity(entity_id)?;
        if !self.working.contains_key(&entity_id) {
            let mut entries = BTreeMap::new();
            if let Some(acl) = self.db.acls().get(entity_id)? {
                for entry in &acl.entries {
                    entries.insert(entry.key(), *entry);
                }
            }
            self.working.insert(entity_id, WorkingAcl { entries });
        }
        self.working
            .get_mut(&entity_id)
            .ok_or_else(|| PermTreeError::Storage("working acl vanished".into()))
    }

    fn entry_mut(
        &mut self,
        entity_id: EntityId,
        identity_id: IdentityId,
        local_only: bool,
    ) -> PermTreeResult<&mut AclEntry> {
        if identity_id == 0 {
            return Err(PermTreeError::InvalidArgument(
                "identity id must not be zero".into(),
            ));
        }
        let working = self.working_mut(entity_id)?;
        let key: EntryKey = (identity_id, local_only, EntryKind::Normal);
        Ok(working.entries.entry(key).or_insert(AclEntry {
            identity_id,
            local_only,
            kind: EntryKind::Normal,
            allow: 0,
            deny: 0,
        }))
    }
}
