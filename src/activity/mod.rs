//! Ordered activities and their scheduler.
//!
//! Every structural, ACL or membership mutation travels as an activity: a
//! tagged variant with an explicit discriminant, a monotonic sequence id
//! assigned at persistence time and an origin marker. The
//! [`queue::ActivityQueue`] computes dependency edges between in-flight
//! activities so conflicting ones apply in the same relative order on every
//! node while independent ones run concurrently.

pub mod queue;
pub mod serializer;

pub use queue::{ActivityQueue, CompletionHandle, QueueStats};
pub use serializer::{ActivitySerializer, JsonActivitySerializer};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::PermDb;
use crate::model::{Acl, ActivityId, EntityId, IdentityId};

/// Where an activity originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivityOrigin {
    /// Created on this node; it is persisted and broadcast before apply.
    Local,
    /// Received from another node or replayed from the activity log; such
    /// an activity already happened elsewhere and is only applied.
    #[default]
    Received,
}

/// Payload of a set-acl activity: full per-entity ACL replacements plus
/// inheritance flag changes, applied as one atomic batch. Break flags are
/// applied before the ACL replacements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetAclPayload {
    pub acls: Vec<Acl>,
    pub breaks: Vec<EntityId>,
    pub unbreaks: Vec<EntityId>,
}

impl SetAclPayload {
    /// Every entity id the batch touches.
    pub fn touched_entities(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.acls.iter().map(|acl| acl.entity_id).collect();
        ids.extend_from_slice(&self.breaks);
        ids.extend_from_slice(&self.unbreaks);
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// The tagged variant set of every mutation the kernel distributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivityBody {
    CreateEntity {
        entity_id: EntityId,
        parent_id: Option<EntityId>,
        owner_id: IdentityId,
    },
    DeleteEntity {
        entity_id: EntityId,
    },
    ModifyOwner {
        entity_id: EntityId,
        owner_id: IdentityId,
    },
    MoveEntity {
        source_id: EntityId,
        target_id: EntityId,
    },
    SetAcl(SetAclPayload),
    AddMembers {
        group_id: IdentityId,
        users: Vec<IdentityId>,
        groups: Vec<IdentityId>,
    },
    RemoveMembers {
        group_id: IdentityId,
        users: Vec<IdentityId>,
        groups: Vec<IdentityId>,
    },
    AddUserToGroups {
        user_id: IdentityId,
        groups: Vec<IdentityId>,
    },
    RemoveUserFromGroups {
        user_id: IdentityId,
        groups: Vec<IdentityId>,
    },
    DeleteGroup {
        group_id: IdentityId,
    },
    DeleteUser {
        user_id: IdentityId,
    },
    DeleteIdentities {
        ids: Vec<IdentityId>,
    },
    /// Discards and rebuilds all three in-memory stores from the
    /// persistence layer. A full barrier in the scheduler.
    ReloadCache,
    /// Fills a gap in the incoming sequence: applies no mutation but still
    /// satisfies ordering and unblocks waiters.
    Placeholder,
}

impl ActivityBody {
    /// Short discriminant name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ActivityBody::CreateEntity { .. } => "create_entity",
            ActivityBody::DeleteEntity { .. } => "delete_entity",
            ActivityBody::ModifyOwner { .. } => "modify_owner",
            ActivityBody::MoveEntity { .. } => "move_entity",
            ActivityBody::SetAcl(_) => "set_acl",
            ActivityBody::AddMembers { .. } => "add_members",
            ActivityBody::RemoveMembers { .. } => "remove_members",
            ActivityBody::AddUserToGroups { .. } => "add_user_to_groups",
            ActivityBody::RemoveUserFromGroups { .. } => "remove_user_from_groups",
            ActivityBody::DeleteGroup { .. } => "delete_group",
            ActivityBody::DeleteUser { .. } => "delete_user",
            ActivityBody::DeleteIdentities { .. } => "delete_identities",
            ActivityBody::ReloadCache => "reload_cache",
            ActivityBody::Placeholder => "placeholder",
        }
    }

    /// Membership changes can alter the outcome of any permission check,
    /// so they act as a global scheduling barrier.
    pub fn is_membership_change(&self) -> bool {
        matches!(
            self,
            ActivityBody::AddMembers { .. }
                | ActivityBody::RemoveMembers { .. }
                | ActivityBody::AddUserToGroups { .. }
                | ActivityBody::RemoveUserFromGroups { .. }
                | ActivityBody::DeleteGroup { .. }
                | ActivityBody::DeleteUser { .. }
                | ActivityBody::DeleteIdentities { .. }
        )
    }

    /// A cache reload waits for every older activity and blocks every
    /// newer one.
    pub fn is_barrier(&self) -> bool {
        matches!(self, ActivityBody::ReloadCache)
    }

    /// Entity-tree activities use the containment-aware conflict test.
    pub fn is_tree_structural(&self) -> bool {
        matches!(
            self,
            ActivityBody::CreateEntity { .. }
                | ActivityBody::DeleteEntity { .. }
                | ActivityBody::ModifyOwner { .. }
                | ActivityBody::MoveEntity { .. }
        )
    }

    /// Entity ids this activity touches, for conflict detection.
    pub fn touched_entities(&self) -> Vec<EntityId> {
        match self {
            ActivityBody::CreateEntity {
                entity_id,
                parent_id,
                ..
            } => {
                let mut ids = vec![*entity_id];
                if let Some(parent) = parent_id {
                    ids.push(*parent);
                }
                ids
            }
            ActivityBody::DeleteEntity { entity_id } | ActivityBody::ModifyOwner { entity_id, .. } => {
                vec![*entity_id]
            }
            ActivityBody::MoveEntity {
                source_id,
                target_id,
            } => vec![*source_id, *target_id],
            ActivityBody::SetAcl(payload) => payload.touched_entities(),
            _ => Vec::new(),
        }
    }

    /// The pairwise conflict predicate: must this activity wait for an
    /// older, still-active one?
    ///
    /// Membership changes and cache reloads conflict with everything.
    /// Entity-tree activities conflict when their touched ids coincide or
    /// sit in an ancestor/descendant relation, tested via tree containment
    /// rather than whole-tree locking; the same test covers a tree activity
    /// against an ACL batch, since deleting or moving a subtree invalidates
    /// ACL edits beneath it. Two ACL batches conflict only when their
    /// touched-entity sets intersect. Placeholders conflict with nothing.
    pub fn must_wait_for(&self, older: &ActivityBody, db: &PermDb) -> bool {
        if matches!(self, ActivityBody::Placeholder) || matches!(older, ActivityBody::Placeholder) {
            return false;
        }
        if self.is_barrier() || older.is_barrier() {
            return true;
        }
        if self.is_membership_change() || older.is_membership_change() {
            return true;
        }

        let mine = self.touched_entities();
        let theirs = older.touched_entities();
        if mine.is_empty() || theirs.is_empty() {
            return false;
        }

        let both_acl = matches!(self, ActivityBody::SetAcl(_))
            && matches!(older, ActivityBody::SetAcl(_));
        if both_acl {
            return mine.iter().any(|id| theirs.contains(id));
        }

        mine.iter().any(|a| {
            theirs.iter().any(|b| {
                a == b
                    || db.entities().is_same_or_descendant(*a, *b).unwrap_or(false)
                    || db.entities().is_same_or_descendant(*b, *a).unwrap_or(false)
            })
        })
    }
}

/// One ordered mutation: the serializable envelope around an
/// [`ActivityBody`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    /// Monotonic sequence id, assigned by the data store at persistence
    /// time. `None` until a local activity has been stored.
    pub id: Option<ActivityId>,
    /// Runtime-only origin marker; everything that comes off the wire or
    /// the activity log is `Received`.
    #[serde(skip)]
    pub origin: ActivityOrigin,
    pub created_at: DateTime<Utc>,
    pub body: ActivityBody,
}

impl Activity {
    /// Wraps a body as a locally-originated activity.
    pub fn local(body: ActivityBody) -> Self {
        Self {
            id: None,
            origin: ActivityOrigin::Local,
            created_at: Utc::now(),
            body,
        }
    }

    /// Wraps a body as an already-sequenced received activity.
    pub fn received(id: ActivityId, body: ActivityBody) -> Self {
        Self {
            id: Some(id),
            origin: ActivityOrigin::Received,
            created_at: Utc::now(),
            body,
        }
    }
}
