//! # PermTree
//!
//! In-process authorization kernel for a hierarchical, multi-tenant content
//! repository. The crate keeps an in-memory mirror of an entity tree,
//! access-control lists and group membership, and propagates every
//! structural or permission mutation as an ordered *activity* across a
//! cluster of processes, so that all nodes converge to the same state
//! without a shared external lock.
//!
//! ## Core Components
//!
//! * `model` - Plain data types: entities, ACLs, groups, permission bits
//! * `db` - The in-memory kernel: entity tree, ACL index, membership cache
//! * `permissions` - Bitmask permission evaluator and the batching ACL editor
//! * `activity` - Activity variants, the dependency-aware scheduler, serializer
//! * `store` - Persistence boundary (`DataStore`) and its in-memory reference
//! * `network` - Message transport boundary and the in-process loopback bus
//! * `node` - `PermTreeNode`: wires everything together with a lifecycle
//!
//! ## Architecture
//!
//! Callers issue high-level operations against a [`PermTreeNode`]. Each
//! operation is wrapped as an activity and submitted to the
//! [`activity::ActivityQueue`], which detects conflicts against in-flight
//! activities, orders or parallelizes execution, persists and broadcasts
//! locally-originated activities, and finally applies each activity's effect
//! to the in-memory stores. Remote nodes receive the same activities through
//! the transport and only apply them. Read-only permission evaluation never
//! enters the dependency graph and never blocks.

pub mod activity;
pub mod db;
pub mod error;
pub mod model;
pub mod network;
pub mod node;
pub mod permissions;
pub mod store;
pub mod testing;

// Re-export main types for convenience
pub use activity::{Activity, ActivityBody, ActivityOrigin, ActivityQueue, QueueStats};
pub use db::PermDb;
pub use error::{PermTreeError, PermTreeResult};
pub use model::{bits, Acl, AclEntry, Entity, EntityId, Group, IdentityId, OWNERS};
pub use network::{MessageTransport, TransportError, TransportResult};
pub use node::{PermTreeNode, SecurityConfig};
pub use permissions::{AclEditor, PermissionEvaluator, UserPrincipal};
pub use store::DataStore;
