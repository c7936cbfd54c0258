//! Test support utilities.

use std::collections::HashMap;

use crate::model::{EntityId, IdentityId};
use crate::permissions::UserPrincipal;

/// A plain principal for tests: a fixed id plus optional entity-scoped
/// dynamic group memberships.
#[derive(Debug, Clone, Default)]
pub struct TestPrincipal {
    pub user_id: IdentityId,
    pub dynamic: HashMap<EntityId, Vec<IdentityId>>,
}

impl TestPrincipal {
    pub fn new(user_id: IdentityId) -> Self {
        Self {
            user_id,
            dynamic: HashMap::new(),
        }
    }

    /// Adds dynamic groups the principal reports for one entity.
    pub fn with_dynamic(mut self, entity_id: EntityId, groups: Vec<IdentityId>) -> Self {
        self.dynamic.insert(entity_id, groups);
        self
    }
}

impl UserPrincipal for TestPrincipal {
    fn id(&self) -> IdentityId {
        self.user_id
    }

    fn dynamic_groups(&self, entity_id: EntityId) -> Vec<IdentityId> {
        self.dynamic.get(&entity_id).cloned().unwrap_or_default()
    }
}
