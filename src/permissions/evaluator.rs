//! Bitmask permission evaluator.
//!
//! Decisions are computed by walking from the target entity up through its
//! ancestors until the walk passes the nearest inheritance-break boundary
//! (inclusive) or reaches the root. Precedence is nearest-wins per bit:
//! once a bit lands in the running allow or deny total, entries farther up
//! the chain cannot change it. At the target entity, local-only entries
//! form their own precedence step ahead of the propagating entries stored
//! there; local-only entries never apply anywhere else. A bit that ends up
//! in both totals at the same step resolves to denied.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::debug;

use crate::db::PermDb;
use crate::error::{PermTreeError, PermTreeResult};
use crate::model::{AclEntry, Entity, EntityId, IdentityId, PermissionValue, OWNERS};
use crate::permissions::UserPrincipal;

/// Computes permission decisions against the in-memory kernel. Evaluation
/// is read-only: it never enters the activity dependency graph and never
/// blocks on in-flight activities.
#[derive(Clone, Debug)]
pub struct PermissionEvaluator {
    db: Arc<PermDb>,
}

impl PermissionEvaluator {
    pub fn new(db: Arc<PermDb>) -> Self {
        Self { db }
    }

    /// True when every requested bit evaluates to Allowed for the user.
    pub fn has_permission(
        &self,
        user: &dyn UserPrincipal,
        entity_id: EntityId,
        bits: u64,
    ) -> PermTreeResult<bool> {
        let (allow, deny) = self.permission_totals(user, entity_id)?;
        let granted = allow & !deny & bits == bits;
        debug!(
            "permission check: user={} entity={} bits={:#x} allow={:#x} deny={:#x} -> {}",
            user.id(),
            entity_id,
            bits,
            allow,
            deny,
            granted
        );
        Ok(granted)
    }

    /// Decision for a single bit.
    pub fn permission_value(
        &self,
        user: &dyn UserPrincipal,
        entity_id: EntityId,
        bit: u64,
    ) -> PermTreeResult<PermissionValue> {
        let (allow, deny) = self.permission_totals(user, entity_id)?;
        Ok(PermissionValue::from_totals(bit, allow, deny))
    }

    /// Raises [`PermTreeError::AccessDenied`] unless every requested bit is
    /// Allowed.
    pub fn assert_permission(
        &self,
        user: &dyn UserPrincipal,
        entity_id: EntityId,
        bits: u64,
    ) -> PermTreeResult<()> {
        if self.has_permission(user, entity_id, bits)? {
            Ok(())
        } else {
            Err(PermTreeError::AccessDenied {
                entity_id,
                identity_id: user.id(),
                bits,
            })
        }
    }

    /// True when every requested bit is Allowed at the entity and at every
    /// descendant. Short-circuits on the first failing descendant.
    pub fn has_subtree_permission(
        &self,
        user: &dyn UserPrincipal,
        entity_id: EntityId,
        bits: u64,
    ) -> PermTreeResult<bool> {
        if self.db.entities().get(entity_id)?.is_none() {
            return Err(PermTreeError::EntityNotFound(entity_id));
        }
        for id in self.db.entities().subtree_ids(entity_id)? {
            if !self.has_permission(user, id, bits)? {
                debug!("subtree check failed at entity {}", id);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// The running allow/deny totals for one user at one entity.
    pub fn permission_totals(
        &self,
        user: &dyn UserPrincipal,
        entity_id: EntityId,
    ) -> PermTreeResult<(u64, u64)> {
        let start = self
            .db
            .entities()
            .get(entity_id)?
            .ok_or(PermTreeError::EntityNotFound(entity_id))?;
        let identities = self.identity_set(user, &start)?;

        let mut allow = 0u64;
        let mut deny = 0u64;
        self.walk_levels(&start, |acl_entity, entries| {
            let local_step = acl_entity == entity_id;
            // Local-only entries of the target entity take precedence over
            // the propagating entries stored beside them.
            if local_step {
                fold_step(
                    entries.iter().filter(|e| e.local_only),
                    &identities,
                    &mut allow,
                    &mut deny,
                );
            }
            fold_step(
                entries.iter().filter(|e| !e.local_only),
                &identities,
                &mut allow,
                &mut deny,
            );
        })?;
        Ok((allow, deny))
    }

    /// Per-identity merged allow/deny bitmasks at one entity, after
    /// applying the nearest-wins-per-bit rule across all ancestor levels up
    /// to the break boundary.
    pub fn effective_entries(
        &self,
        entity_id: EntityId,
    ) -> PermTreeResult<BTreeMap<IdentityId, (u64, u64)>> {
        let start = self
            .db
            .entities()
            .get(entity_id)?
            .ok_or(PermTreeError::EntityNotFound(entity_id))?;

        let mut totals: BTreeMap<IdentityId, (u64, u64)> = BTreeMap::new();
        self.walk_levels(&start, |acl_entity, entries| {
            let local_step = acl_entity == entity_id;
            if local_step {
                fold_step_per_identity(entries.iter().filter(|e| e.local_only), &mut totals);
            }
            fold_step_per_identity(entries.iter().filter(|e| !e.local_only), &mut totals);
        })?;
        totals.retain(|_, (a, d)| *a != 0 || *d != 0);
        Ok(totals)
    }

    /// Materializes the entity's currently effective permissions as
    /// explicit entries: the entity's own local-only entries verbatim, plus
    /// one propagating entry per identity carrying the inherited-and-
    /// explicit merge. Used when inheritance is broken with copy semantics:
    /// replacing the entity's ACL with this list leaves every check at and
    /// below the entity unchanged.
    pub fn materialized_entries(&self, entity_id: EntityId) -> PermTreeResult<Vec<AclEntry>> {
        let start = self
            .db
            .entities()
            .get(entity_id)?
            .ok_or(PermTreeError::EntityNotFound(entity_id))?;

        let mut out: Vec<AclEntry> = Vec::new();
        if let Some(acl) = self.db.acls().get(entity_id)? {
            out.extend(acl.entries.iter().filter(|e| e.local_only).copied());
        }

        let mut totals: BTreeMap<IdentityId, (u64, u64)> = BTreeMap::new();
        self.walk_levels(&start, |_, entries| {
            fold_step_per_identity(entries.iter().filter(|e| !e.local_only), &mut totals);
        })?;
        for (identity_id, (a, d)) in totals {
            let entry = AclEntry::new(identity_id, false, a, d);
            if !entry.is_empty() {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Per-identity masks that inheritance alone would produce at the
    /// entity: the propagating entries of the strict ancestor chain, under
    /// the usual precedence. Used to detect redundant explicit entries when
    /// inheritance is restored with normalization.
    pub fn inherited_view(
        &self,
        entity_id: EntityId,
    ) -> PermTreeResult<BTreeMap<IdentityId, (u64, u64)>> {
        let start = self
            .db
            .entities()
            .get(entity_id)?
            .ok_or(PermTreeError::EntityNotFound(entity_id))?;

        let mut totals: BTreeMap<IdentityId, (u64, u64)> = BTreeMap::new();
        let Some(parent_id) = start.parent_id else {
            return Ok(totals);
        };
        let parent = self
            .db
            .entities()
            .get(parent_id)?
            .ok_or(PermTreeError::EntityNotFound(parent_id))?;
        self.walk_levels(&parent, |_, entries| {
            fold_step_per_identity(entries.iter().filter(|e| !e.local_only), &mut totals);
        })?;
        totals.retain(|_, (a, d)| *a != 0 || *d != 0);
        Ok(totals)
    }

    /// Visits the ACL-bearing levels of the ancestor walk, nearest first,
    /// stopping after the first inheritance-break boundary. Uses the
    /// nearest-holder index to skip ancestors that carry neither an ACL nor
    /// a boundary.
    fn walk_levels(
        &self,
        start: &Arc<Entity>,
        mut visit: impl FnMut(EntityId, &[AclEntry]),
    ) -> PermTreeResult<()> {
        let entities = self.db.entities();
        let acls = self.db.acls();
        let mut current = Arc::clone(start);
        loop {
            if let Some(acl) = acls.get(current.id)? {
                visit(current.id, &acl.entries);
            }
            if !current.is_inherited {
                break;
            }
            let Some(parent_id) = current.parent_id else {
                break;
            };
            let parent = entities
                .get(parent_id)?
                .ok_or(PermTreeError::EntityNotFound(parent_id))?;
            current = if parent.nearest_holder_id != parent.id {
                entities
                    .get(parent.nearest_holder_id)?
                    .ok_or(PermTreeError::EntityNotFound(parent.nearest_holder_id))?
            } else {
                parent
            };
        }
        Ok(())
    }

    /// Identities an entry may match for this user at this entity: the user
    /// itself, its transitive static groups merged with the principal's
    /// entity-scoped dynamic groups, and the OWNERS marker when the user
    /// owns the target entity.
    fn identity_set(
        &self,
        user: &dyn UserPrincipal,
        entity: &Entity,
    ) -> PermTreeResult<BTreeSet<IdentityId>> {
        let mut identities = self.db.groups_of(user.id())?;
        identities.insert(user.id());
        identities.extend(user.dynamic_groups(entity.id));
        if entity.owner_id == user.id() {
            identities.insert(OWNERS);
        }
        Ok(identities)
    }
}

/// One precedence step: OR the matching entries' masks into the running
/// totals, but only for bits no nearer step has decided yet.
fn fold_step<'a>(
    entries: impl Iterator<Item = &'a AclEntry>,
    identities: &BTreeSet<IdentityId>,
    allow: &mut u64,
    deny: &mut u64,
) {
    let mut step_allow = 0u64;
    let mut step_deny = 0u64;
    for entry in entries {
        if !identities.contains(&entry.identity_id) {
            continue;
        }
        step_allow |= entry.allow;
        step_deny |= entry.deny;
    }
    let undecided = !(*allow | *deny);
    *allow |= step_allow & undecided;
    *deny |= step_deny & undecided;
}

/// The per-identity variant of [`fold_step`], used for effective-entry
/// aggregation where no identity filter applies.
fn fold_step_per_identity<'a>(
    entries: impl Iterator<Item = &'a AclEntry>,
    totals: &mut BTreeMap<IdentityId, (u64, u64)>,
) {
    let mut step: BTreeMap<IdentityId, (u64, u64)> = BTreeMap::new();
    for entry in entries {
        let slot = step.entry(entry.identity_id).or_insert((0, 0));
        slot.0 |= entry.allow;
        slot.1 |= entry.deny;
    }
    for (identity_id, (step_allow, step_deny)) in step {
        let (allow, deny) = totals.entry(identity_id).or_insert((0, 0));
        let undecided = !(*allow | *deny);
        *allow |= step_allow & undecided;
        *deny |= step_deny & undecided;
    }
}
