//! In-memory transport for tests.
//!
//! [`FakeConnector`] records every handle it creates; tests drive each
//! [`FakeClient`] by emitting events through the sink the session passed in.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::{
    address::ChatId,
    transport::{
        ConnectContext, EventSink, TransportClient, TransportConnector, TransportError,
        TransportErrorKind, TransportEvent,
    },
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct ConnectorState {
    clients: Vec<Arc<FakeClient>>,
    fail_creates: usize,
    fail_starts: usize,
    fail_destroy: bool,
}

/// Connector handing out [`FakeClient`]s.
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of handles successfully created.
    pub fn created(&self) -> usize {
        lock(&self.state).clients.len()
    }

    /// Handles created and not yet destroyed.
    pub fn live(&self) -> usize {
        lock(&self.state)
            .clients
            .iter()
            .filter(|c| !c.is_destroyed())
            .count()
    }

    pub fn client(&self, idx: usize) -> Option<Arc<FakeClient>> {
        lock(&self.state).clients.get(idx).cloned()
    }

    pub fn latest(&self) -> Option<Arc<FakeClient>> {
        lock(&self.state).clients.last().cloned()
    }

    pub fn fail_next_creates(&self, n: usize) {
        lock(&self.state).fail_creates = n;
    }

    /// Make the next `n` created handles fail in `start()`.
    pub fn fail_next_starts(&self, n: usize) {
        lock(&self.state).fail_starts = n;
    }

    /// Make `destroy()` on every handle, current and future, return an error.
    pub fn fail_destroy(&self, fail: bool) {
        let mut state = lock(&self.state);
        state.fail_destroy = fail;
        for client in &state.clients {
            lock(&client.inner).fail_destroy = fail;
        }
    }
}

impl TransportConnector for FakeConnector {
    fn create(&self, ctx: ConnectContext) -> Result<Arc<dyn TransportClient>, TransportError> {
        let mut state = lock(&self.state);
        if state.fail_creates > 0 {
            state.fail_creates -= 1;
            return Err(TransportError::new(
                TransportErrorKind::Io,
                "bridge executable not found",
            ));
        }
        let fail_start = state.fail_starts > 0;
        if fail_start {
            state.fail_starts -= 1;
        }
        let client = Arc::new(FakeClient {
            generation: ctx.generation,
            events: ctx.events,
            inner: Mutex::new(ClientState {
                fail_start,
                fail_destroy: state.fail_destroy,
                ..ClientState::default()
            }),
        });
        state.clients.push(Arc::clone(&client));
        Ok(client)
    }
}

#[derive(Default)]
struct ClientState {
    started: bool,
    destroyed: bool,
    sent: Vec<(String, String)>,
    send_failures: Vec<TransportError>,
    fail_start: bool,
    fail_destroy: bool,
}

/// One fake transport handle.
pub struct FakeClient {
    generation: u64,
    events: EventSink,
    inner: Mutex<ClientState>,
}

impl FakeClient {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: TransportEvent) {
        self.events.emit(event);
    }

    pub fn pairing_code(&self, code: &str) {
        self.emit(TransportEvent::PairingCode(code.to_string()));
    }

    pub fn ready(&self) {
        self.emit(TransportEvent::Ready);
    }

    pub fn disconnect(&self, reason: &str) {
        self.emit(TransportEvent::Disconnected(reason.to_string()));
    }

    pub fn auth_failure(&self, reason: &str) {
        self.emit(TransportEvent::AuthFailure(reason.to_string()));
    }

    /// Successfully delivered `(recipient, text)` pairs, in order.
    pub fn sent(&self) -> Vec<(String, String)> {
        lock(&self.inner).sent.clone()
    }

    /// Queue an error for the next `send_text` call.
    pub fn fail_next_send(&self, err: TransportError) {
        lock(&self.inner).send_failures.push(err);
    }

    pub fn is_started(&self) -> bool {
        lock(&self.inner).started
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.inner).destroyed
    }
}

#[async_trait]
impl TransportClient for FakeClient {
    async fn start(&self) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        inner.started = true;
        if inner.fail_start {
            return Err(TransportError::new(
                TransportErrorKind::ConnectionLost,
                "browser failed to launch",
            ));
        }
        Ok(())
    }

    async fn send_text(&self, to: &ChatId, text: &str) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        if inner.destroyed {
            return Err(TransportError::classify("Session closed"));
        }
        if !inner.send_failures.is_empty() {
            return Err(inner.send_failures.remove(0));
        }
        inner.sent.push((to.as_str().to_string(), text.to_string()));
        Ok(())
    }

    async fn destroy(&self) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        inner.destroyed = true;
        if inner.fail_destroy {
            return Err(TransportError::new(
                TransportErrorKind::Protocol,
                "Target closed",
            ));
        }
        Ok(())
    }
}
