//! Cycle-tolerant group-membership cache.
//!
//! Keeps the raw group containment graph and a flattened user-to-groups
//! closure. The containment graph may contain cycles (a group can indirectly
//! contain itself), so flattening iterates to a fixed point instead of doing
//! a single depth-first pass: a cycle discovered late can still add
//! reachable groups to users processed earlier. Incremental edge changes
//! recompute only the affected connected component.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::debug;

use crate::error::{PermTreeError, PermTreeResult};
use crate::model::{Group, IdentityId};

#[derive(Default, Debug)]
struct MembershipTables {
    groups: HashMap<IdentityId, Group>,
    /// user id -> every group the user is transitively a member of
    flat: HashMap<IdentityId, BTreeSet<IdentityId>>,
}

/// Group containment graph plus flattened user-to-group closures.
#[derive(Default, Debug)]
pub struct MembershipCache {
    tables: RwLock<MembershipTables>,
}

impl MembershipCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> PermTreeResult<RwLockReadGuard<'_, MembershipTables>> {
        self.tables
            .read()
            .map_err(|_| PermTreeError::Storage("membership table lock poisoned".into()))
    }

    fn write(&self) -> PermTreeResult<RwLockWriteGuard<'_, MembershipTables>> {
        self.tables
            .write()
            .map_err(|_| PermTreeError::Storage("membership table lock poisoned".into()))
    }

    /// True when the user is a direct or transitive member of the group.
    pub fn is_member(&self, user_id: IdentityId, group_id: IdentityId) -> PermTreeResult<bool> {
        Ok(self
            .read()?
            .flat
            .get(&user_id)
            .map(|groups| groups.contains(&group_id))
            .unwrap_or(false))
    }

    /// Every group the user transitively belongs to.
    pub fn groups_of(&self, user_id: IdentityId) -> PermTreeResult<BTreeSet<IdentityId>> {
        Ok(self.read()?.flat.get(&user_id).cloned().unwrap_or_default())
    }

    /// Raw group snapshot, if the group exists.
    pub fn group(&self, group_id: IdentityId) -> PermTreeResult<Option<Group>> {
        Ok(self.read()?.groups.get(&group_id).cloned())
    }

    pub fn group_count(&self) -> PermTreeResult<usize> {
        Ok(self.read()?.groups.len())
    }

    /// Snapshot of the flattened closures, for verification.
    pub fn flat_snapshot(&self) -> PermTreeResult<HashMap<IdentityId, BTreeSet<IdentityId>>> {
        Ok(self.read()?.flat.clone())
    }

    /// Snapshot of every raw group, for verification and bulk persistence.
    pub fn group_snapshot(&self) -> PermTreeResult<Vec<Group>> {
        Ok(self.read()?.groups.values().cloned().collect())
    }

    /// Adds user and group members to a group, creating referenced groups
    /// that do not exist yet, then recomputes the affected component.
    pub fn add_members(
        &self,
        group_id: IdentityId,
        users: &[IdentityId],
        groups: &[IdentityId],
    ) -> PermTreeResult<()> {
        if group_id == 0 || users.contains(&0) || groups.contains(&0) {
            return Err(PermTreeError::InvalidArgument(
                "identity ids must not be zero".into(),
            ));
        }
        let mut tables = self.write()?;
        tables.groups.entry(group_id).or_insert_with(|| Group::new(group_id));
        for user in users {
            if let Some(group) = tables.groups.get_mut(&group_id) {
                group.user_members.insert(*user);
            }
        }
        for member in groups {
            tables.groups.entry(*member).or_insert_with(|| Group::new(*member));
            if let Some(group) = tables.groups.get_mut(&group_id) {
                group.group_members.insert(*member);
            }
            if let Some(child) = tables.groups.get_mut(member) {
                child.parent_groups.insert(group_id);
            }
        }
        recompute_component(&mut tables, &[group_id]);
        Ok(())
    }

    /// Removes user and group members from a group. A missing group or a
    /// missing edge is a no-op. Reachability is recomputed, not merely
    /// subtracted: a removed member can still be connected through an
    /// alternate path of a cycle.
    pub fn remove_members(
        &self,
        group_id: IdentityId,
        users: &[IdentityId],
        groups: &[IdentityId],
    ) -> PermTreeResult<()> {
        let mut tables = self.write()?;
        if !tables.groups.contains_key(&group_id) {
            debug!("remove_members on missing group {} ignored", group_id);
            return Ok(());
        }
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
        let mut seeds = vec![group_id];
        seeds.extend_from_slice(groups);
        recompute_component(&mut tables, &seeds);
        Ok(())
    }

    /// Adds one user to several groups, creating groups that do not exist.
    pub fn add_user_to_groups(
        &self,
        user_id: IdentityId,
        groups: &[IdentityId],
    ) -> PermTreeResult<()> {
        if user_id == 0 || groups.contains(&0) {
            return Err(PermTreeError::InvalidArgument(
                "identity ids must not be zero".into(),
            ));
        }
        let mut tables = self.write()?;
        for group_id in groups {
            tables
                .groups
                .entry(*group_id)
                .or_insert_with(|| Group::new(*group_id))
                .user_members
                .insert(user_id);
        }
        recompute_component(&mut tables, groups);
        Ok(())
    }

    /// Removes one user from several groups. Missing groups are ignored.
    pub fn remove_user_from_groups(
        &self,
        user_id: IdentityId,
        groups: &[IdentityId],
    ) -> PermTreeResult<()> {
        let mut tables = self.write()?;
        for group_id in groups {
            if let Some(group) = tables.groups.get_mut(group_id) {
                group.user_members.remove(&user_id);
            }
        }
        recompute_component(&mut tables, groups);
        Ok(())
    }

    /// Deletes a group: removes the node, every edge touching it and every
    /// flattened closure entry referencing it, then recomputes the
    /// component its former neighbors belong to. Deleting a missing group
    /// is a no-op.
    pub fn delete_group(&self, group_id: IdentityId) -> PermTreeResult<()> {
        let mut tables = self.write()?;
        delete_group_locked(&mut tables, group_id);
        Ok(())
    }

    /// Batch identity removal: each id is removed as a user from every
    /// group and the flat map, and as a group if one with that id exists.
    pub fn delete_identities(&self, ids: &[IdentityId]) -> PermTreeResult<()> {
        let mut tables = self.write()?;
        for id in ids {
            delete_identity_locked(&mut tables, *id);
        }
        Ok(())
    }

    pub fn clear(&self) -> PermTreeResult<()> {
        let mut tables = self.write()?;
        tables.groups.clear();
        tables.flat.clear();
        Ok(())
    }

    /// Replaces the whole cache from a bulk-loaded group list. Parent
    /// back-references are rederived from the member edges, then the
    /// closures are flattened to a fixed point.
    pub fn rebuild(&self, groups: Vec<Group>) -> PermTreeResult<()> {
        let mut tables = self.write()?;
        tables.groups.clear();
        tables.flat.clear();
        for group in groups {
            tables.groups.insert(group.id, group);
        }
        let ids: Vec<IdentityId> = tables.groups.keys().copied().collect();
        for id in &ids {
            if let Some(group) = tables.groups.get_mut(id) {
                group.parent_groups.clear();
            }
        }
        for id in &ids {
            let members: Vec<IdentityId> = tables
                .groups
                .get(id)
                .map(|g| g.group_members.iter().copied().collect())
                .unwrap_or_default();
            for member in members {
                if let Some(child) = tables.groups.get_mut(&member) {
                    child.parent_groups.insert(*id);
                }
            }
        }
        flatten_all(&mut tables);
        Ok(())
    }
}

fn delete_identity_locked(tables: &mut MembershipTables, id: IdentityId) {
    // As a user: drop the closure and every direct membership edge. Other
    // users' closures are unaffected by a pure user removal.
    tables.flat.remove(&id);
    let containing: Vec<IdentityId> = tables
        .groups
        .values()
        .filter(|g| g.user_members.contains(&id))
        .map(|g| g.id)
        .collect();
    for gid in &containing {
        if let Some(group) = tables.groups.get_mut(gid) {
            group.user_members.remove(&id);
        }
    }
    // As a group.
    delete_group_locked(tables, id);
}

fn delete_group_locked(tables: &mut MembershipTables, group_id: IdentityId) {
    let Some(group) = tables.groups.remove(&group_id) else {
        return;
    };
    debug!("deleting group {}", group_id);
    let mut neighbors: BTreeSet<IdentityId> = BTreeSet::new();
    neighbors.extend(group.parent_groups.iter().copied());
    neighbors.extend(group.group_members.iter().copied());
    for parent in &group.parent_groups {
        if let Some(p) = tables.groups.get_mut(parent) {
            p.group_members.remove(&group_id);
        }
    }
    for member in &group.group_members {
        if let Some(m) = tables.groups.get_mut(member) {
            m.parent_groups.remove(&group_id);
        }
    }
    for closure in tables.flat.values_mut() {
        closure.remove(&group_id);
    }
    tables.flat.retain(|_, closure| !closure.is_empty());
    let seeds: Vec<IdentityId> = neighbors.into_iter().collect();
    recompute_component(tables, &seeds);
}

/// Weakly-connected component of the containment graph around the seeds.
fn component(tables: &MembershipTables, seeds: &[IdentityId]) -> BTreeSet<IdentityId> {
    let mut seen: BTreeSet<IdentityId> = BTreeSet::new();
    let mut queue: VecDeque<IdentityId> = seeds
        .iter()
        .copied()
        .filter(|id| tables.groups.contains_key(id))
        .collect();
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(group) = tables.groups.get(&id) {
            for next in group.group_members.iter().chain(group.parent_groups.iter()) {
                if tables.groups.contains_key(next) && !seen.contains(next) {
                    queue.push_back(*next);
                }
            }
        }
    }
    seen
}

/// Recomputes the user closures of one connected component from scratch.
/// Closures of groups outside the component cannot change, because no
/// containment edge crosses a component boundary.
fn recompute_component(tables: &mut MembershipTables, seeds: &[IdentityId]) {
    let comp = component(tables, seeds);
    if comp.is_empty() {
        return;
    }
    let users_of = flatten_groups(tables, &comp);

    let mut affected: BTreeSet<IdentityId> = tables
        .flat
        .iter()
        .filter(|(_, groups)| groups.iter().any(|g| comp.contains(g)))
        .map(|(user, _)| *user)
        .collect();
    for users in users_of.values() {
        affected.extend(users.iter().copied());
    }

    for user in affected {
        let closure = tables.flat.entry(user).or_default();
        closure.retain(|g| !comp.contains(g));
        for (gid, users) in &users_of {
            if users.contains(&user) {
                closure.insert(*gid);
            }
        }
        if closure.is_empty() {
            tables.flat.remove(&user);
        }
    }
}

/// Full re-flatten of every group.
fn flatten_all(tables: &mut MembershipTables) {
    let all: BTreeSet<IdentityId> = tables.groups.keys().copied().collect();
    let users_of = flatten_groups(tables, &all);
    tables.flat.clear();
    for (gid, users) in users_of {
        for user in users {
            tables.flat.entry(user).or_default().insert(gid);
        }
    }
}

/// Fixed-point flattening of the given group set: per group, the users
/// reachable through any chain of member edges. A single pass is not
/// enough in the presence of cycles, so the loop runs until no user set
/// grows anymore.
fn flatten_groups(
    tables: &MembershipTables,
    scope: &BTreeSet<IdentityId>,
) -> HashMap<IdentityId, BTreeSet<IdentityId>> {
    let mut users_of: HashMap<IdentityId, BTreeSet<IdentityId>> = scope
        .iter()
        .filter_map(|id| tables.groups.get(id))
        .map(|g| (g.id, g.user_members.clone()))
        .collect();

    loop {
        let mut changed = false;
        for gid in scope {
            let members: Vec<IdentityId> = match tables.groups.get(gid) {
                Some(group) => group
                    .group_members
                    .iter()
                    .copied()
                    .filter(|m| users_of.contains_key(m))
                    .collect(),
                None => continue,
            };
            for member in members {
                let add: Vec<IdentityId> = users_of
                    .get(&member)
                    .map(|users| users.iter().copied().collect())
                    .unwrap_or_default();
                if add.is_empty() {
                    continue;
                }
                let target = users_of.entry(*gid).or_default();
                let before = target.len();
                target.extend(add);
                if target.len() != before {
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
    users_of
}
