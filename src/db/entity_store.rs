//! In-memory entity tree.
//!
//! An arena of entity nodes addressed by integer id. Parents are resolved by
//! id lookup, which keeps snapshots cheap and sidesteps reference-cycle
//! lifetime issues. Mutations replace whole `Arc<Entity>` snapshots under a
//! short write lock; readers clone the `Arc` and never observe a
//! partially-updated node.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, warn};

use crate::error::{PermTreeError, PermTreeResult};
use crate::model::{Entity, EntityId, IdentityId};

#[derive(Default, Debug)]
struct EntityTables {
    entities: HashMap<EntityId, Arc<Entity>>,
    children: HashMap<EntityId, BTreeSet<EntityId>>,
}

/// Arena of entity nodes indexed by id, with parent/child bookkeeping and
/// the nearest-ACL-holder index.
#[derive(Default, Debug)]
pub struct EntityStore {
    tables: RwLock<EntityTables>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> PermTreeResult<RwLockReadGuard<'_, EntityTables>> {
        self.tables
            .read()
            .map_err(|_| PermTreeError::Storage("entity table lock poisoned".into()))
    }

    fn write(&self) -> PermTreeResult<RwLockWriteGuard<'_, EntityTables>> {
        self.tables
            .write()
            .map_err(|_| PermTreeError::Storage("entity table lock poisoned".into()))
    }

    /// Creates an entity under the given parent. A zero id is rejected; a
    /// missing parent is an error. Re-creating an existing id is tolerated
    /// and only updates the owner (last write wins).
    pub fn create(
        &self,
        id: EntityId,
        parent_id: Option<EntityId>,
        owner_id: IdentityId,
    ) -> PermTreeResult<()> {
        if id == 0 {
            return Err(PermTreeError::InvalidArgument(
                "entity id must not be zero".into(),
            ));
        }
        if parent_id == Some(0) {
            return Err(PermTreeError::InvalidArgument(
                "parent id must not be zero".into(),
            ));
        }

        let mut tables = self.write()?;

        if let Some(existing) = tables.entities.get(&id).cloned() {
            debug!("entity {} already exists, updating owner to {}", id, owner_id);
            let mut updated = (*existing).clone();
            updated.owner_id = owner_id;
            tables.entities.insert(id, Arc::new(updated));
            return Ok(());
        }

        let (level, nearest_holder_id) = match parent_id {
            Some(pid) => {
                let parent = tables
                    .entities
                    .get(&pid)
                    .ok_or(PermTreeError::EntityNotFound(pid))?;
                (parent.level + 1, parent.nearest_holder_id)
            }
            None => (0, id),
        };

        let entity = Entity {
            id,
            owner_id,
            parent_id,
            is_inherited: true,
            nearest_holder_id,
            level,
        };
        tables.entities.insert(id, Arc::new(entity));
        if let Some(pid) = parent_id {
            tables.children.entry(pid).or_default().insert(id);
        }
        debug!("created entity {} under {:?}", id, parent_id);
        Ok(())
    }

    /// Removes the entity and its entire subtree. Deleting a missing id is
    /// a successful no-op. Returns the removed ids so the caller can sweep
    /// ACLs referencing them.
    pub fn delete(&self, id: EntityId) -> PermTreeResult<Vec<EntityId>> {
        let mut tables = self.write()?;
        if !tables.entities.contains_key(&id) {
            debug!("delete of missing entity {} ignored", id);
            return Ok(Vec::new());
        }

        let removed = collect_subtree(&tables, id);
        if let Some(parent_id) = tables.entities.get(&id).and_then(|e| e.parent_id) {
            if let Some(siblings) = tables.children.get_mut(&parent_id) {
                siblings.remove(&id);
            }
        }
        for rid in &removed {
            tables.entities.remove(rid);
            tables.children.remove(rid);
        }
        debug!("deleted entity {} and {} descendants", id, removed.len() - 1);
        Ok(removed)
    }

    /// Reparents `source` under `target` and recomputes levels and the
    /// nearest-holder index for the moved subtree. Moving an entity under
    /// itself or one of its descendants would create a cycle and is
    /// rejected.
    pub fn move_entity(
        &self,
        source: EntityId,
        target: EntityId,
        holds_acl: &dyn Fn(EntityId) -> bool,
    ) -> PermTreeResult<()> {
        if source == 0 || target == 0 {
            return Err(PermTreeError::InvalidArgument(
                "move requires non-zero source and target ids".into(),
            ));
        }

        let mut tables = self.write()?;
        if !tables.entities.contains_key(&source) {
            return Err(PermTreeError::EntityNotFound(source));
        }
        if !tables.entities.contains_key(&target) {
            return Err(PermTreeError::EntityNotFound(target));
        }
        if source == target || is_same_or_descendant_locked(&tables, source, target) {
            return Err(PermTreeError::InvalidArgument(format!(
                "cannot move entity {} under its own subtree ({})",
                source, target
            )));
        }

        let old_parent = tables.entities.get(&source).and_then(|e| e.parent_id);
        if let Some(pid) = old_parent {
            if let Some(siblings) = tables.children.get_mut(&pid) {
                siblings.remove(&source);
            }
        }
        tables.children.entry(target).or_default().insert(source);

        let source_entity = tables
            .entities
            .get(&source)
            .cloned()
            .ok_or(PermTreeError::EntityNotFound(source))?;
        let mut updated = (*source_entity).clone();
        updated.parent_id = Some(target);
        tables.entities.insert(source, Arc::new(updated));

        refresh_subtree_locked(&mut tables, source, holds_acl);
        debug!("moved entity {} from {:?} under {}", source, old_parent, target);
        Ok(())
    }

    /// Pure attribute update with the same validation as create.
    pub fn modify_owner(&self, id: EntityId, owner_id: IdentityId) -> PermTreeResult<()> {
        if id == 0 {
            return Err(PermTreeError::InvalidArgument(
                "entity id must not be zero".into(),
            ));
        }
        let mut tables = self.write()?;
        let entity = tables
            .entities
            .get(&id)
            .cloned()
            .ok_or(PermTreeError::EntityNotFound(id))?;
        let mut updated = (*entity).clone();
        updated.owner_id = owner_id;
        tables.entities.insert(id, Arc::new(updated));
        Ok(())
    }

    /// Flips the inheritance flag. Setting the flag to its current value is
    /// a successful no-op. Returns true when the flag actually changed; the
    /// nearest-holder index of the subtree is refreshed in that case, since
    /// the break boundary stops upward lookups regardless of whether the
    /// entity's own ACL is empty.
    pub fn set_inheritance(
        &self,
        id: EntityId,
        is_inherited: bool,
        holds_acl: &dyn Fn(EntityId) -> bool,
    ) -> PermTreeResult<bool> {
        let mut tables = self.write()?;
        let entity = tables
            .entities
            .get(&id)
            .cloned()
            .ok_or(PermTreeError::EntityNotFound(id))?;
        if entity.is_inherited == is_inherited {
            debug!("inheritance of entity {} already {}", id, is_inherited);
            return Ok(false);
        }
        let mut updated = (*entity).clone();
        updated.is_inherited = is_inherited;
        tables.entities.insert(id, Arc::new(updated));
        refresh_subtree_locked(&mut tables, id, holds_acl);
        Ok(true)
    }

    /// Recomputes the nearest-holder index for the subtree rooted at `id`,
    /// typically after an ACL appeared on or vanished from the root.
    pub fn refresh_holders(
        &self,
        id: EntityId,
        holds_acl: &dyn Fn(EntityId) -> bool,
    ) -> PermTreeResult<()> {
        let mut tables = self.write()?;
        if tables.entities.contains_key(&id) {
            refresh_subtree_locked(&mut tables, id, holds_acl);
        }
        Ok(())
    }

    /// Returns the entity snapshot for the given id.
    pub fn get(&self, id: EntityId) -> PermTreeResult<Option<Arc<Entity>>> {
        Ok(self.read()?.entities.get(&id).cloned())
    }

    /// Direct children of the given entity.
    pub fn children_of(&self, id: EntityId) -> PermTreeResult<Vec<EntityId>> {
        Ok(self
            .read()?
            .children
            .get(&id)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default())
    }

    /// The entity and all of its descendants, parents before children.
    /// Missing root yields an empty list.
    pub fn subtree_ids(&self, id: EntityId) -> PermTreeResult<Vec<EntityId>> {
        let tables = self.read()?;
        if !tables.entities.contains_key(&id) {
            return Ok(Vec::new());
        }
        Ok(collect_subtree(&tables, id))
    }

    /// True when `candidate` equals `ancestor` or lies in its subtree.
    pub fn is_same_or_descendant(
        &self,
        ancestor: EntityId,
        candidate: EntityId,
    ) -> PermTreeResult<bool> {
        let tables = self.read()?;
        Ok(is_same_or_descendant_locked(&tables, ancestor, candidate))
    }

    pub fn len(&self) -> PermTreeResult<usize> {
        Ok(self.read()?.entities.len())
    }

    /// Snapshot of every entity, for verification and bulk persistence.
    pub fn snapshot(&self) -> PermTreeResult<Vec<Arc<Entity>>> {
        Ok(self.read()?.entities.values().cloned().collect())
    }

    pub fn clear(&self) -> PermTreeResult<()> {
        let mut tables = self.write()?;
        tables.entities.clear();
        tables.children.clear();
        Ok(())
    }

    /// Replaces the whole tree from a bulk-loaded entity list, rebuilding
    /// the child index, levels and the nearest-holder index from scratch.
    /// Entities whose parent is absent are treated as roots.
    pub fn rebuild(
        &self,
        entities: Vec<Entity>,
        holds_acl: &dyn Fn(EntityId) -> bool,
    ) -> PermTreeResult<()> {
        let mut tables = self.write()?;
        tables.entities.clear();
        tables.children.clear();

        for entity in entities {
            tables.entities.insert(entity.id, Arc::new(entity));
        }

        let ids: Vec<EntityId> = tables.entities.keys().copied().collect();
        let mut roots = Vec::new();
        for id in &ids {
            let parent = tables.entities.get(id).and_then(|e| e.parent_id);
            match parent {
                Some(pid) if tables.entities.contains_key(&pid) => {
                    tables.children.entry(pid).or_default().insert(*id);
                }
                Some(pid) => {
                    warn!("entity {} references missing parent {}, treating as root", id, pid);
                    let orphan = tables.entities.get(id).cloned();
                    if let Some(orphan) = orphan {
                        let mut fixed = (*orphan).clone();
                        fixed.parent_id = None;
                        tables.entities.insert(*id, Arc::new(fixed));
                    }
                    roots.push(*id);
                }
                None => roots.push(*id),
            }
        }
        for root in roots {
            refresh_subtree_locked(&mut tables, root, holds_acl);
        }
        Ok(())
    }
}

/// Subtree ids in breadth-first order, root first.
fn collect_subtree(tables: &EntityTables, root: EntityId) -> Vec<EntityId> {
    let mut out = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(id) = queue.pop_front() {
        out.push(id);
        if let Some(children) = tables.children.get(&id) {
            queue.extend(children.iter().copied());
        }
    }
    out
}

fn is_same_or_descendant_locked(
    tables: &EntityTables,
    ancestor: EntityId,
    candidate: EntityId,
) -> bool {
    let mut current = Some(candidate);
    while let Some(id) = current {
        if id == ancestor {
            return true;
        }
        current = tables.entities.get(&id).and_then(|e| e.parent_id);
    }
    false
}

/// Recomputes level and nearest-holder for the subtree rooted at `root`,
/// parents before children so each node can rely on its parent's fresh
/// snapshot.
fn refresh_subtree_locked(
    tables: &mut EntityTables,
    root: EntityId,
    holds_acl: &dyn Fn(EntityId) -> bool,
) {
    for id in collect_subtree(tables, root) {
        let entity = match tables.entities.get(&id) {
            Some(e) => (**e).clone(),
            None => continue,
        };
        let parent = entity.parent_id.and_then(|pid| tables.entities.get(&pid).cloned());
        let level = parent.as_ref().map(|p| p.level + 1).unwrap_or(0);
        let nearest_holder_id = if holds_acl(id) || !entity.is_inherited {
            id
        } else {
            match parent {
                Some(p) => p.nearest_holder_id,
                None => id,
            }
        };
        let mut updated = entity;
        updated.level = level;
        updated.nearest_holder_id = nearest_holder_id;
        tables.entities.insert(id, Arc::new(updated));
    }
}
