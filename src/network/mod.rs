//! Message transport boundary.
//!
//! Distribution of local activities and the inbound activity feed both go
//! through the [`MessageTransport`] trait. Real deployments plug in a
//! queue- or broker-based provider; [`in_process::InProcessHub`] wires
//! several nodes of one process together for tests. Transport failures are
//! caught at this boundary, logged and surfaced through send/receive
//! results; they never panic and never propagate into caller code.

pub mod error;
#[cfg(feature = "mock")]
pub mod in_process;

pub use error::{TransportError, TransportResult};
#[cfg(feature = "mock")]
pub use in_process::{InProcessHub, InProcessTransport};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Wire boundary for activity distribution.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Identifies the local receiver, so a node can recognize and skip its
    /// own broadcasts.
    fn receiver_id(&self) -> Uuid;

    /// Broadcasts one serialized activity to every other node.
    async fn send(&self, payload: Vec<u8>) -> TransportResult<()>;

    /// Hands out the inbound message feed. There is a single consumer; a
    /// second call returns `None`.
    fn take_inbox(&self) -> Option<mpsc::Receiver<Vec<u8>>>;

    /// Starts delivering messages.
    async fn start(&self) -> TransportResult<()>;

    /// Pauses delivery; queued messages are kept.
    async fn stop(&self) -> TransportResult<()>;

    /// Stops delivery for good and releases resources.
    async fn shutdown(&self) -> TransportResult<()>;

    /// Drops messages still queued for this receiver.
    async fn purge(&self) -> TransportResult<()>;
}
