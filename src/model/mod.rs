//! Core data types of the authorization kernel.
//!
//! Everything in this module is plain data: entities, ACLs, groups and the
//! permission bitmask vocabulary. The stores in [`crate::db`] own the mutable
//! state; these types are the immutable snapshots that travel through
//! activities, the persistence boundary and the wire.

pub mod acl;
pub mod entity;
pub mod group;
pub mod permission;

pub use acl::{Acl, AclEntry, EntryKey, EntryKind};
pub use entity::Entity;
pub use group::Group;
pub use permission::{bits, PermissionValue};

/// Identifier of a securable entity in the hierarchical tree.
///
/// Zero is never a valid entity id; structural operations reject it with
/// [`crate::error::PermTreeError::InvalidArgument`].
pub type EntityId = u32;

/// Identifier of a user or a group. Users and groups share one identity
/// space, so an ACL entry or a membership edge can reference either.
pub type IdentityId = u32;

/// Monotonic activity sequence id, assigned by the data store when an
/// activity is persisted.
pub type ActivityId = u64;

/// Well-known marker identity for ACL entries that apply to whoever owns
/// the entity a permission check targets.
pub const OWNERS: IdentityId = IdentityId::MAX;
