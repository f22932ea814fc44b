//! Status events: process-wide publish/subscribe of session transitions.

use {
    serde::Serialize,
    tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError},
    tracing::warn,
};

use crate::pairing::PairingArtifact;

/// A session transition, as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    Initializing { generation: u64 },
    PairingRequested { qr: PairingArtifact },
    Ready,
    Disconnected { reason: String },
    AuthFailed { reason: String },
    Restarting { attempt: u32, delay_ms: u64 },
    RestartsExhausted { attempts: u32 },
}

/// Bounded broadcast of [`StatusEvent`]s. No replay: subscribers only see
/// events published after they attach.
#[derive(Debug, Clone)]
pub struct StatusEvents {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to current subscribers. Returns how many received it.
    pub fn publish(&self, event: StatusEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> StatusSubscription {
        StatusSubscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One attached subscriber. Dropping it detaches.
#[derive(Debug)]
pub struct StatusSubscription {
    rx: broadcast::Receiver<StatusEvent>,
}

impl StatusSubscription {
    /// Next event, or `None` once the publisher is gone.
    ///
    /// A subscriber that falls behind loses the overwritten events and
    /// continues from the oldest one still buffered.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "status subscriber lagged, events dropped");
                },
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<StatusEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "status subscriber lagged, events dropped");
                },
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}
