use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::IdentityId;

/// A security group: a set of user members and contained groups.
///
/// `parent_groups` is a pure back-reference (never an ownership edge); the
/// containment graph may contain cycles, and the membership cache is
/// required to flatten it anyway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: IdentityId,
    /// Users that are direct members of this group.
    pub user_members: BTreeSet<IdentityId>,
    /// Groups directly contained in this group.
    pub group_members: BTreeSet<IdentityId>,
    /// Groups this group is a direct member of.
    pub parent_groups: BTreeSet<IdentityId>,
}

impl Group {
    /// Creates an empty group.
    pub fn new(id: IdentityId) -> Self {
        Self {
            id,
            user_members: BTreeSet::new(),
            group_members: BTreeSet::new(),
            parent_groups: BTreeSet::new(),
        }
    }

}
