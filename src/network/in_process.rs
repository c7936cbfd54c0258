//! In-process loopback transport.
//!
//! An [`InProcessHub`] connects the transports of several nodes living in
//! one process. Every send is fanned out through a broadcast channel; each
//! transport filters out its own messages by receiver id and forwards the
//! rest into its inbox. Multi-node convergence tests run on top of this.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::network::{MessageTransport, TransportError, TransportResult};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone)]
struct Envelope {
    from: Uuid,
    payload: Vec<u8>,
}

/// Fan-out hub shared by the in-process transports of one test cluster.
pub struct InProcessHub {
    bus: broadcast::Sender<Envelope>,
}

impl InProcessHub {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let (bus, _) = broadcast::channel(capacity);
        Arc::new(Self { bus })
    }

    /// Creates a transport endpoint attached to this hub.
    pub fn transport(self: &Arc<Self>) -> InProcessTransport {
        let (inbox_tx, inbox_rx) = mpsc::channel(DEFAULT_CAPACITY);
        InProcessTransport {
            hub: Arc::clone(self),
            id: Uuid::new_v4(),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            forward_task: Mutex::new(None),
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }
}

/// One node's endpoint on an [`InProcessHub`].
pub struct InProcessTransport {
    hub: Arc<InProcessHub>,
    id: Uuid,
    inbox_tx: mpsc::Sender<Vec<u8>>,
    inbox_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    forward_task: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    closed: AtomicBool,
}

impl InProcessTransport {
    fn abort_forwarding(&self) {
        if let Ok(mut task) = self.forward_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageTransport for InProcessTransport {
    fn receiver_id(&self) -> Uuid {
        self.id
    }

    async fn send(&self, payload: Vec<u8>) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::NotStarted);
        }
        self.hub
            .bus
            .send(Envelope {
                from: self.id,
                payload,
            })
            .map(|_| ())
            .map_err(|_| TransportError::SendFailed("no receivers on the hub".into()))
    }

    fn take_inbox(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.inbox_rx.lock().ok().and_then(|mut slot| slot.take())
    }

    async fn start(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut bus = self.hub.bus.subscribe();
        let inbox = self.inbox_tx.clone();
        let local_id = self.id;
        let handle = tokio::spawn(async move {
            loop {
                match bus.recv().await {
                    Ok(envelope) => {
                        if envelope.from == local_id {
                            continue;
                        }
                        if inbox.send(envelope.payload).await.is_err() {
                            debug!("inbox of {} closed, stopping forwarder", local_id);
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("transport {} lagged, dropped {} messages", local_id, missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        if let Ok(mut task) = self.forward_task.lock() {
            *task = Some(handle);
        }
        debug!("in-process transport {} started", self.id);
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        self.abort_forwarding();
        Ok(())
    }

    async fn shutdown(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.abort_forwarding();
        Ok(())
    }

    async fn purge(&self) -> TransportResult<()> {
        if let Ok(mut slot) = self.inbox_rx.lock() {
            if let Some(inbox) = slot.as_mut() {
                while inbox.try_recv().is_ok() {}
            }
        }
        Ok(())
    }
}
