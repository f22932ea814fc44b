use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

use pairgate_whatsapp::WhatsAppSession;

/// Shared gateway runtime state.
pub struct GatewayState {
    pub session: WhatsAppSession,
    pub version: String,
    pub started_at: Instant,
    event_clients: AtomicUsize,
}

impl GatewayState {
    pub fn new(session: WhatsAppSession) -> Arc<Self> {
        Arc::new(Self {
            session,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Instant::now(),
            event_clients: AtomicUsize::new(0),
        })
    }

    /// Number of open event WebSocket connections.
    pub fn event_client_count(&self) -> usize {
        self.event_clients.load(Ordering::Relaxed)
    }

    pub(crate) fn event_client_opened(&self) -> usize {
        self.event_clients.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn event_client_closed(&self) {
        self.event_clients.fetch_sub(1, Ordering::Relaxed);
    }
}
