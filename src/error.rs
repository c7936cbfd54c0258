use thiserror::Error;

use crate::model::{EntityId, IdentityId};
use crate::network::TransportError;

/// Unified error type for the authorization kernel.
///
/// Each variant represents one category from the kernel's error taxonomy.
/// Structural operations validate their arguments (`InvalidArgument`,
/// `EntityNotFound`); permission assertions surface `AccessDenied`; a caller
/// waiting on its own activity can hit `ActivityTimeout`. Failures of the
/// external collaborators are folded in as `Storage`, `Serialization` and
/// `Transport`.
#[derive(Error, Debug)]
pub enum PermTreeError {
    /// A zero or otherwise invalid id was passed to a structural operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A referenced entity, parent or move target is absent.
    #[error("entity {0} not found")]
    EntityNotFound(EntityId),

    /// An assert-permission check failed.
    #[error("access denied: identity {identity_id} lacks bits {bits:#x} on entity {entity_id}")]
    AccessDenied {
        entity_id: EntityId,
        identity_id: IdentityId,
        bits: u64,
    },

    /// A local completion wait exceeded its configured bound. The activity's
    /// effect is not retracted; other nodes may already be applying it.
    #[error("timed out waiting for activity completion")]
    ActivityTimeout,

    /// The data store reported a failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Activity marshaling failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The message transport reported a failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<serde_json::Error> for PermTreeError {
    fn from(error: serde_json::Error) -> Self {
        PermTreeError::Serialization(error.to_string())
    }
}

/// Result type alias for operations that can fail with a [`PermTreeError`].
pub type PermTreeResult<T> = Result<T, PermTreeError>;
