//! Persistence boundary.
//!
//! The kernel never talks to a database directly; the store phase of every
//! local activity goes through the [`DataStore`] trait. Real deployments
//! plug in a SQL-backed implementation; [`memory::MemoryDataStore`] is the
//! in-memory reference used by tests and single-process embeddings.

#[cfg(feature = "mock")]
pub mod memory;

#[cfg(feature = "mock")]
pub use memory::MemoryDataStore;

use async_trait::async_trait;

use crate::activity::Activity;
use crate::error::PermTreeResult;
use crate::model::{Acl, ActivityId, Entity, EntityId, Group, IdentityId};

/// Bulk snapshot of everything the kernel mirrors, used for cold start and
/// cache reload.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub entities: Vec<Entity>,
    pub acls: Vec<Acl>,
    pub groups: Vec<Group>,
}

/// The persistence boundary consumed by the store phase of local
/// activities and by cold start / reload.
///
/// `save_activity` assigns the cluster-wide monotonic sequence id; the
/// per-activity execution lock keeps two executors from persisting the
/// same activity's effect twice when a store is shared.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn upsert_entity(
        &self,
        id: EntityId,
        parent_id: Option<EntityId>,
        owner_id: IdentityId,
    ) -> PermTreeResult<()>;

    /// Removes entity rows and their ACLs. The caller passes the whole
    /// subtree; the store does not recurse on its own.
    async fn delete_entities(&self, ids: &[EntityId]) -> PermTreeResult<()>;

    async fn set_entity_owner(&self, id: EntityId, owner_id: IdentityId) -> PermTreeResult<()>;

    async fn move_entity(&self, source_id: EntityId, target_id: EntityId) -> PermTreeResult<()>;

    /// Writes one entity's ACL wholesale.
    async fn write_acl(&self, acl: &Acl) -> PermTreeResult<()>;

    async fn remove_acl(&self, entity_id: EntityId) -> PermTreeResult<()>;

    async fn set_inheritance(&self, entity_id: EntityId, inherits: bool) -> PermTreeResult<()>;

    async fn add_group_members(
        &self,
        group_id: IdentityId,
        users: &[IdentityId],
        groups: &[IdentityId],
    ) -> PermTreeResult<()>;

    async fn remove_group_members(
        &self,
        group_id: IdentityId,
        users: &[IdentityId],
        groups: &[IdentityId],
    ) -> PermTreeResult<()>;

    /// Removes identities wholesale: group rows, membership edges and
    /// every ACL entry referencing them.
    async fn delete_identities(&self, ids: &[IdentityId]) -> PermTreeResult<()>;

    /// Appends an activity to the log and returns its assigned sequence
    /// id.
    async fn save_activity(&self, activity: &Activity) -> PermTreeResult<ActivityId>;

    /// Loads the inclusive id range from the activity log.
    async fn load_activities(
        &self,
        from: ActivityId,
        to: ActivityId,
    ) -> PermTreeResult<Vec<Activity>>;

    /// Loads specific ids (gap fill) from the activity log. Missing ids
    /// are silently absent from the result.
    async fn load_activities_by_ids(&self, ids: &[ActivityId]) -> PermTreeResult<Vec<Activity>>;

    async fn last_activity_id(&self) -> PermTreeResult<ActivityId>;

    /// Claims the execution lock for one activity. Returns false when
    /// another executor already holds it.
    async fn acquire_activity_lock(&self, id: ActivityId) -> PermTreeResult<bool>;

    async fn release_activity_lock(&self, id: ActivityId) -> PermTreeResult<()>;

    /// Bulk-loads everything for cold start or cache reload.
    async fn load_all(&self) -> PermTreeResult<StoreSnapshot>;
}
