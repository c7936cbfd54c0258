use serde::{Deserialize, Serialize};

use super::{EntityId, IdentityId};

/// A securable node in the hierarchical object tree.
///
/// Entities reference their parent by id, never by pointer; the tree is an
/// arena keyed by [`EntityId`]. Instances are immutable snapshots: the store
/// replaces the whole `Arc<Entity>` on mutation, so a concurrent permission
/// check never observes a partially-updated node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique id of this entity. Never zero.
    pub id: EntityId,
    /// Identity that owns this entity.
    pub owner_id: IdentityId,
    /// Parent entity id; `None` for a root.
    pub parent_id: Option<EntityId>,
    /// False once inheritance has been broken at this entity.
    pub is_inherited: bool,
    /// Closest ancestor-or-self that holds an explicit ACL or is an
    /// inheritance break boundary. Short-circuits permission walks.
    pub nearest_holder_id: EntityId,
    /// Distance from the root; roots are level 0.
    pub level: u32,
}

impl Entity {
    /// Creates a root-level entity snapshot with inheritance enabled.
    pub fn new(id: EntityId, parent_id: Option<EntityId>, owner_id: IdentityId) -> Self {
        Self {
            id,
            owner_id,
            parent_id,
            is_inherited: true,
            nearest_holder_id: id,
            level: 0,
        }
    }

    /// True when this entity has no parent.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}
