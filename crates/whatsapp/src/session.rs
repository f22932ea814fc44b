//! The session actor and its cloneable handle.
//!
//! One task owns the state machine, the outbound queue and the single
//! transport handle. Callers talk to it through [`WhatsAppSession`]; every
//! transition is serialized through the actor's mailbox. Reads of the current
//! status go through a `watch` channel and never wait on the actor.

use std::{sync::Arc, time::Duration};

use {
    pairgate_config::WhatsAppConfig,
    serde::Serialize,
    tokio::sync::{mpsc, oneshot, watch},
    tracing::{debug, info, warn},
};

use crate::{
    address::ChatId,
    error::SessionError,
    events::{StatusEvents, StatusSubscription},
    pairing::{PairingArtifact, PairingLookup},
    queue::OutboundQueue,
    state::{Effect, Input, SessionMachine, SessionState},
    store::CredentialStore,
    supervisor::{self, RestartDue, RestartPolicy, RestartTask},
    transport::{
        ConnectContext, EventSink, TransportClient, TransportConnector, TransportError,
        TransportErrorKind, TransportEvent,
    },
};

const MAILBOX_CAPACITY: usize = 256;

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client_id: String,
    pub store: CredentialStore,
    pub queue_capacity: Option<usize>,
    pub event_capacity: usize,
    pub restart: RestartPolicy,
    pub send_timeout: Duration,
    pub destroy_timeout: Duration,
}

impl SessionOptions {
    /// Baseline options: unbounded queue, fixed 3 s restart cool-down.
    pub fn new(client_id: impl Into<String>, store: CredentialStore) -> Self {
        Self {
            client_id: client_id.into(),
            store,
            queue_capacity: None,
            event_capacity: 64,
            restart: RestartPolicy::default(),
            send_timeout: Duration::from_secs(30),
            destroy_timeout: Duration::from_secs(5),
        }
    }

    pub fn from_config(cfg: &WhatsAppConfig, store: CredentialStore) -> Self {
        Self {
            client_id: cfg.client_id.clone(),
            store,
            queue_capacity: cfg.queue_capacity,
            event_capacity: cfg.event_capacity,
            restart: RestartPolicy::from_config(&cfg.restart),
            send_timeout: cfg.send_timeout(),
            destroy_timeout: cfg.destroy_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    Sent,
    Queued,
    Failed,
}

/// Outcome of one `send()` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendReport {
    pub status: SendStatus,
    pub recipient: ChatId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SendReport {
    fn new(status: SendStatus, recipient: ChatId) -> Self {
        Self {
            status,
            recipient,
            detail: None,
        }
    }

    fn failed(recipient: ChatId, detail: impl Into<String>) -> Self {
        Self {
            status: SendStatus::Failed,
            recipient,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub ready: bool,
}

/// Point-in-time view of the session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_artifact: Option<PairingArtifact>,
    pub queued: usize,
    pub generation: u64,
    pub restart_attempts: u32,
    pub auth_failed: bool,
}

impl SessionSnapshot {
    fn of(machine: &SessionMachine, queued: usize) -> Self {
        Self {
            state: machine.state(),
            ready: machine.is_ready(),
            pairing_artifact: machine.pairing_artifact().cloned(),
            queued,
            generation: machine.generation(),
            restart_attempts: machine.restart_attempts(),
            auth_failed: machine.auth_failed(),
        }
    }
}

enum Command {
    Initialize {
        reply: oneshot::Sender<SessionState>,
    },
    Send {
        recipient: ChatId,
        text: String,
        reply: oneshot::Sender<SendReport>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Actor-internal signals from tasks the actor spawned.
enum Internal {
    StartFailed {
        generation: u64,
        error: TransportError,
    },
    RestartRequested,
}

/// Handle to the process's single WhatsApp session. Cheap to clone.
///
/// The actor stops, destroying its transport, on [`shutdown`](Self::shutdown)
/// or when the last handle is dropped.
#[derive(Clone)]
pub struct WhatsAppSession {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    events: StatusEvents,
}

impl std::fmt::Debug for WhatsAppSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot.borrow();
        f.debug_struct("WhatsAppSession")
            .field("state", &snap.state)
            .field("generation", &snap.generation)
            .finish()
    }
}

impl WhatsAppSession {
    /// Spawn the actor on the current Tokio runtime. The session starts in
    /// `Uninitialized`; call [`initialize`](Self::initialize) to connect.
    pub fn spawn(connector: Arc<dyn TransportConnector>, options: SessionOptions) -> Self {
        let machine = SessionMachine::new(options.restart.clone());
        let (snapshot_tx, snapshot) = watch::channel(SessionSnapshot::of(&machine, 0));
        let events = StatusEvents::new(options.event_capacity);
        let (commands, command_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (due_tx, due_rx) = mpsc::unbounded_channel();

        let actor = SessionActor {
            queue: OutboundQueue::new(options.queue_capacity),
            machine,
            connector,
            transport: None,
            events: events.clone(),
            snapshot_tx,
            transport_tx,
            internal_tx,
            due_tx,
            restart_task: None,
            options,
        };
        tokio::spawn(actor.run(command_rx, transport_rx, internal_rx, due_rx));

        Self {
            commands,
            snapshot,
            events,
        }
    }

    /// Start the session lifecycle. A no-op while one is already running;
    /// returns the state after the call.
    pub async fn initialize(&self) -> Result<SessionState, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Initialize { reply }, rx).await
    }

    /// Deliver `text` to `recipient` now if ready, otherwise queue it.
    ///
    /// Validation failures return `Err`; everything else is a [`SendReport`].
    pub async fn send(&self, recipient: &str, text: &str) -> Result<SendReport, SessionError> {
        let recipient = ChatId::parse(recipient)?;
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let (reply, rx) = oneshot::channel();
        let command = Command::Send {
            recipient,
            text: text.to_string(),
            reply,
        };
        self.request(command, rx).await
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            ready: self.snapshot.borrow().ready,
        }
    }

    pub fn pairing_artifact(&self) -> PairingLookup {
        self.snapshot.borrow().pairing_artifact.clone().into()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Attach a status event subscriber. Only later events are delivered;
    /// use [`snapshot`](Self::snapshot) for the current state.
    pub fn subscribe(&self) -> StatusSubscription {
        self.events.subscribe()
    }

    /// Wait until the session reports ready, up to `timeout`.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.snapshot.clone();
        tokio::time::timeout(timeout, rx.wait_for(|s| s.ready))
            .await
            .is_ok_and(|seen| seen.is_ok())
    }

    /// Destroy the transport (best effort) and stop the actor.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn request<T>(
        &self,
        command: Command,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}

struct SessionActor {
    machine: SessionMachine,
    queue: OutboundQueue,
    connector: Arc<dyn TransportConnector>,
    transport: Option<Arc<dyn TransportClient>>,
    events: StatusEvents,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    transport_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    due_tx: mpsc::UnboundedSender<RestartDue>,
    restart_task: Option<RestartTask>,
    options: SessionOptions,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut transport_rx: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
        mut due_rx: mpsc::UnboundedReceiver<RestartDue>,
    ) {
        debug!(client_id = %self.options.client_id, "whatsapp session actor started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    },
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    },
                },
                Some((generation, event)) = transport_rx.recv() => {
                    self.handle_transport_event(generation, event).await;
                },
                Some(internal) = internal_rx.recv() => self.handle_internal(internal).await,
                Some(due) = due_rx.recv() => {
                    if due.generation == self.machine.generation() {
                        self.feed(Input::RestartDue).await;
                    } else {
                        debug!(generation = due.generation, "stale restart signal ignored");
                    }
                },
            }
        }
        debug!(client_id = %self.options.client_id, "whatsapp session actor stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initialize { reply } => {
                self.feed(Input::Initialize).await;
                let _ = reply.send(self.machine.state());
            },
            Command::Send {
                recipient,
                text,
                reply,
            } => {
                let (report, follow_up) = self.dispatch(recipient, text).await;
                let _ = reply.send(report);
                match follow_up {
                    Some(input) => self.feed(input).await,
                    None => self.publish_snapshot(),
                }
            },
            Command::Shutdown { .. } => {},
        }
    }

    /// Send now when ready, otherwise queue. Returns the caller's report and,
    /// for a fatal transport error, the input that disconnects the session.
    async fn dispatch(&mut self, recipient: ChatId, text: String) -> (SendReport, Option<Input>) {
        let client = match (&self.transport, self.machine.is_ready()) {
            (Some(client), true) => Arc::clone(client),
            _ => {
                return match self.queue.push(recipient.clone(), text) {
                    Ok(seq) => {
                        info!(to = %recipient, seq, state = %self.machine.state(), "whatsapp not ready, message queued");
                        (SendReport::new(SendStatus::Queued, recipient), None)
                    },
                    Err(full) => {
                        warn!(to = %recipient, error = %full, "dropping message, queue full");
                        (SendReport::failed(recipient, full.to_string()), None)
                    },
                };
            },
        };

        match self.deliver(&client, &recipient, &text).await {
            Ok(()) => {
                info!(to = %recipient, "message sent");
                (SendReport::new(SendStatus::Sent, recipient), None)
            },
            Err(e) if e.is_fatal() => {
                warn!(to = %recipient, error = %e, "transport lost during send, restarting session");
                let follow_up = Input::Fatal(format!("send failed: {e}"));
                (SendReport::failed(recipient, e.to_string()), Some(follow_up))
            },
            Err(e) => {
                warn!(to = %recipient, error = %e, "send failed");
                (SendReport::failed(recipient, e.to_string()), None)
            },
        }
    }

    async fn deliver(
        &self,
        client: &Arc<dyn TransportClient>,
        recipient: &ChatId,
        text: &str,
    ) -> Result<(), TransportError> {
        let timeout = self.options.send_timeout;
        tokio::time::timeout(timeout, client.send_text(recipient, text))
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::new(
                    TransportErrorKind::Timeout,
                    format!("send timed out after {timeout:?}"),
                ))
            })
    }

    async fn handle_transport_event(&mut self, generation: u64, event: TransportEvent) {
        if generation != self.machine.generation() {
            debug!(generation, current = self.machine.generation(), ?event, "event from stale transport ignored");
            return;
        }
        let input = match event {
            TransportEvent::PairingCode(code) => match PairingArtifact::render(&code) {
                Ok(artifact) => {
                    info!(generation, "whatsapp pairing QR generated");
                    Input::PairingCode(artifact)
                },
                Err(e) => {
                    warn!(generation, error = %e, "failed to render pairing code");
                    return;
                },
            },
            TransportEvent::Ready => {
                info!(generation, "whatsapp is ready");
                Input::TransportReady
            },
            TransportEvent::Disconnected(reason) => {
                warn!(generation, reason = %reason, "whatsapp disconnected");
                Input::TransportDisconnected(reason)
            },
            TransportEvent::AuthFailure(reason) => {
                warn!(generation, reason = %reason, "whatsapp authentication failed, not restarting");
                Input::AuthFailure(reason)
            },
            TransportEvent::StateChanged(state) => {
                info!(generation, state = %state, "whatsapp transport state");
                return;
            },
        };
        self.feed(input).await;
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::StartFailed { generation, error } => {
                if generation != self.machine.generation() {
                    debug!(generation, "start failure from stale transport ignored");
                    return;
                }
                warn!(generation, error = %error, "whatsapp initialization failed");
                self.feed(Input::Fatal(format!("initialization failed: {error}")))
                    .await;
            },
            Internal::RestartRequested => self.feed(Input::RestartRequested).await,
        }
    }

    /// Apply `input` and run the resulting effects. Effects may produce a
    /// follow-up input (e.g. a failed create), which is applied in turn.
    async fn feed(&mut self, input: Input) {
        let mut next = Some(input);
        while let Some(input) = next.take() {
            for effect in self.machine.apply(input) {
                if let Some(follow_up) = self.run_effect(effect).await {
                    next = Some(follow_up);
                }
            }
        }
        self.publish_snapshot();
    }

    async fn run_effect(&mut self, effect: Effect) -> Option<Input> {
        match effect {
            Effect::Publish(event) => {
                self.events.publish(event);
                None
            },
            Effect::CreateTransport { generation } => self.create_transport(generation).await,
            Effect::DrainQueue => self.drain_queue().await,
            Effect::ScheduleRestart => {
                let _ = self.internal_tx.send(Internal::RestartRequested);
                None
            },
            Effect::BeginRestart { attempt, delay } => {
                info!(attempt, ?delay, "restarting whatsapp session");
                if let Some(task) = self.restart_task.take() {
                    task.abort();
                }
                self.restart_task = Some(supervisor::spawn_restart(
                    self.transport.take(),
                    delay,
                    self.options.destroy_timeout,
                    self.machine.generation(),
                    self.due_tx.clone(),
                ));
                None
            },
            Effect::DestroyTransport => {
                self.destroy_transport().await;
                None
            },
        }
    }

    async fn create_transport(&mut self, generation: u64) -> Option<Input> {
        // A handle can still be live here after an auth failure.
        self.destroy_transport().await;

        let ctx = ConnectContext {
            generation,
            client_id: self.options.client_id.clone(),
            auth_dir: self.options.store.root().to_path_buf(),
            events: EventSink::new(generation, self.transport_tx.clone()),
        };
        let client = match self.connector.create(ctx) {
            Ok(client) => client,
            Err(e) => {
                warn!(generation, error = %e, "failed to create whatsapp transport");
                return Some(Input::Fatal(format!("initialization failed: {e}")));
            },
        };
        info!(
            generation,
            client_id = %self.options.client_id,
            has_credentials = self.options.store.has_credentials(&self.options.client_id),
            "starting whatsapp transport"
        );
        self.transport = Some(Arc::clone(&client));

        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            if let Err(error) = client.start().await {
                let _ = internal.send(Internal::StartFailed { generation, error });
            }
        });
        None
    }

    /// Flush queued messages in order. Failures are logged and skipped; a
    /// fatal one disconnects the session once the pass completes.
    async fn drain_queue(&mut self) -> Option<Input> {
        let pending = self.queue.drain();
        if pending.is_empty() {
            return None;
        }
        let Some(client) = self.transport.clone() else {
            warn!(count = pending.len(), "ready without a transport handle, queued messages dropped");
            return None;
        };
        info!(count = pending.len(), "processing queued messages");

        let mut fatal = None;
        for message in pending {
            match self.deliver(&client, &message.recipient, &message.payload).await {
                Ok(()) => debug!(to = %message.recipient, seq = message.enqueued_at, "queued message sent"),
                Err(e) => {
                    warn!(to = %message.recipient, seq = message.enqueued_at, error = %e, "queued message failed");
                    if e.is_fatal() && fatal.is_none() {
                        fatal = Some(Input::Fatal(format!("send failed: {e}")));
                    }
                },
            }
        }
        fatal
    }

    async fn destroy_transport(&mut self) {
        let Some(client) = self.transport.take() else {
            return;
        };
        match supervisor::teardown(client, self.options.destroy_timeout).await {
            Ok(()) => debug!("whatsapp transport destroyed"),
            Err(e) => warn!(error = %e, "ignoring transport teardown failure"),
        }
    }

    async fn shutdown(&mut self) {
        info!("shutting down whatsapp session");
        if let Some(task) = self.restart_task.take() {
            task.cancel(self.options.destroy_timeout).await;
        }
        self.feed(Input::Shutdown).await;
        if !self.queue.is_empty() {
            warn!(count = self.queue.len(), "discarding undelivered queued messages");
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx
            .send_replace(SessionSnapshot::of(&self.machine, self.queue.len()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{events::StatusEvent, fake::FakeConnector};

    const COOLDOWN: Duration = Duration::from_secs(3);

    fn options(dir: &tempfile::TempDir) -> SessionOptions {
        let store = CredentialStore::open(dir.path().join("auth")).unwrap();
        SessionOptions {
            restart: RestartPolicy::fixed(COOLDOWN),
            ..SessionOptions::new("test-session", store)
        }
    }

    fn spawn(dir: &tempfile::TempDir) -> (WhatsAppSession, FakeConnector) {
        let connector = FakeConnector::new();
        let session = WhatsAppSession::spawn(Arc::new(connector.clone()), options(dir));
        (session, connector)
    }

    /// Let the actor and its spawned tasks run until idle.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    async fn ready_session(dir: &tempfile::TempDir) -> (WhatsAppSession, FakeConnector) {
        let (session, connector) = spawn(dir);
        session.initialize().await.unwrap();
        connector.latest().unwrap().ready();
        assert!(session.wait_until_ready(Duration::from_secs(1)).await);
        (session, connector)
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (session, connector) = spawn(&dir);

        for _ in 0..5 {
            session.initialize().await.unwrap();
        }
        assert_eq!(connector.created(), 1);
        assert_eq!(connector.live(), 1);

        connector.latest().unwrap().ready();
        assert!(session.wait_until_ready(Duration::from_secs(1)).await);
        assert_eq!(session.initialize().await.unwrap(), SessionState::Ready);
        assert_eq!(connector.created(), 1);
    }

    #[tokio::test]
    async fn scenario_queue_then_ready_then_send() {
        let dir = tempfile::tempdir().unwrap();
        let (session, connector) = spawn(&dir);

        let report = session.send("1555", "hi").await.unwrap();
        assert_eq!(report.status, SendStatus::Queued);
        assert_eq!(report.recipient.as_str(), "1555@c.us");
        assert_eq!(session.snapshot().queued, 1);

        session.initialize().await.unwrap();
        let client = connector.latest().unwrap();
        assert!(client.sent().is_empty());
        client.ready();
        assert!(session.wait_until_ready(Duration::from_secs(1)).await);
        assert_eq!(client.sent(), vec![("1555@c.us".to_string(), "hi".to_string())]);
        assert_eq!(session.snapshot().queued, 0);

        let report = session.send("1555", "yo").await.unwrap();
        assert_eq!(report.status, SendStatus::Sent);
        assert_eq!(client.sent().len(), 2);
    }

    #[tokio::test]
    async fn drain_is_fifo_across_recipients() {
        let dir = tempfile::tempdir().unwrap();
        let (session, connector) = spawn(&dir);
        session.initialize().await.unwrap();

        let sends = [("2", "a"), ("1", "b"), ("3", "c"), ("2", "d")];
        for (to, text) in sends {
            assert_eq!(session.send(to, text).await.unwrap().status, SendStatus::Queued);
        }
        connector.latest().unwrap().ready();
        assert!(session.wait_until_ready(Duration::from_secs(1)).await);

        let texts: Vec<String> = connector
            .latest()
            .unwrap()
            .sent()
            .into_iter()
            .map(|(_, text)| text)
            .collect();
        assert_eq!(texts, ["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn drain_continues_past_failures() {
        let dir = tempfile::tempdir().unwrap();
        let (session, connector) = spawn(&dir);
        session.initialize().await.unwrap();
        session.send("1", "first").await.unwrap();
        session.send("1", "second").await.unwrap();

        let client = connector.latest().unwrap();
        client.fail_next_send(TransportError::new(TransportErrorKind::Rejected, "bad wid"));
        client.ready();
        assert!(session.wait_until_ready(Duration::from_secs(1)).await);

        assert_eq!(client.sent(), vec![("1@c.us".to_string(), "second".to_string())]);
        assert_eq!(session.snapshot().queued, 0);
    }

    #[tokio::test]
    async fn validation_errors_do_not_touch_state() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _connector) = spawn(&dir);

        assert!(matches!(
            session.send("", "hi").await,
            Err(SessionError::InvalidRecipient(_))
        ));
        assert!(matches!(
            session.send("1555", "").await,
            Err(SessionError::EmptyMessage)
        ));
        // Whitespace is still text.
        assert_eq!(session.send("1555", "  ").await.unwrap().status, SendStatus::Queued);
        let snap = session.snapshot();
        assert_eq!(snap.queued, 1);
        assert_eq!(snap.state, SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn fatal_send_fails_once_and_is_not_requeued() {
        let dir = tempfile::tempdir().unwrap();
        let (session, connector) = ready_session(&dir).await;
        let mut events = session.subscribe();

        connector.latest().unwrap().fail_next_send(TransportError::classify(
            "Protocol error (Runtime.callFunctionOn): Session closed.",
        ));
        let report = session.send("1555", "total: 42").await.unwrap();
        assert_eq!(report.status, SendStatus::Failed);
        assert!(report.detail.unwrap().contains("Session closed"));

        settle().await;
        let snap = session.snapshot();
        assert!(!snap.ready);
        assert_eq!(snap.queued, 0);
        assert!(matches!(
            events.recv().await,
            Some(StatusEvent::Disconnected { .. })
        ));
        assert!(matches!(
            events.recv().await,
            Some(StatusEvent::Restarting { attempt: 1, .. })
        ));
    }

    #[tokio::test]
    async fn non_fatal_send_error_keeps_session_ready() {
        let dir = tempfile::tempdir().unwrap();
        let (session, connector) = ready_session(&dir).await;

        connector
            .latest()
            .unwrap()
            .fail_next_send(TransportError::new(TransportErrorKind::Rejected, "no such user"));
        let report = session.send("1555", "hi").await.unwrap();
        assert_eq!(report.status, SendStatus::Failed);
        assert!(session.status().ready);
    }

    #[tokio::test]
    async fn pairing_artifact_superseded_by_ready() {
        let dir = tempfile::tempdir().unwrap();
        let (session, connector) = spawn(&dir);
        let mut events = session.subscribe();
        assert_eq!(session.pairing_artifact(), PairingLookup::Unavailable);

        session.initialize().await.unwrap();
        let client = connector.latest().unwrap();
        client.pairing_code("2@pairing-ref");
        assert!(matches!(events.recv().await, Some(StatusEvent::Initializing { generation: 1 })));
        let Some(StatusEvent::PairingRequested { qr }) = events.recv().await else {
            panic!("expected pairing event");
        };
        settle().await;
        assert_eq!(session.pairing_artifact(), PairingLookup::Available(qr));
        assert_eq!(session.snapshot().state, SessionState::AwaitingPairing);

        client.ready();
        assert!(session.wait_until_ready(Duration::from_secs(1)).await);
        assert_eq!(session.pairing_artifact(), PairingLookup::Unavailable);
        assert_eq!(events.recv().await, Some(StatusEvent::Ready));
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_disconnect_restarts_after_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let (session, connector) = ready_session(&dir).await;
        let first = connector.latest().unwrap();

        first.disconnect("NAVIGATION");
        settle().await;
        assert!(!session.status().ready);
        assert_eq!(session.snapshot().state, SessionState::Restarting);
        assert!(first.is_destroyed());
        assert_eq!(connector.created(), 1);

        tokio::time::sleep(COOLDOWN + Duration::from_millis(10)).await;
        settle().await;
        assert_eq!(connector.created(), 2);
        assert_eq!(connector.live(), 1);
        let snap = session.snapshot();
        assert_eq!(snap.state, SessionState::Initializing);
        assert_eq!(snap.generation, 2);

        // Messages sent while restarting are queued and flushed on the new handle.
        assert_eq!(session.send("1555", "late").await.unwrap().status, SendStatus::Queued);
        connector.latest().unwrap().ready();
        assert!(session.wait_until_ready(Duration::from_secs(1)).await);
        assert_eq!(connector.latest().unwrap().sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_auth_failure_does_not_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (session, connector) = spawn(&dir);
        let mut events = session.subscribe();
        session.initialize().await.unwrap();

        connector.latest().unwrap().auth_failure("credentials rejected");
        settle().await;
        tokio::time::sleep(COOLDOWN * 2).await;
        settle().await;

        assert_eq!(connector.created(), 1);
        let snap = session.snapshot();
        assert_eq!(snap.state, SessionState::Disconnected);
        assert!(snap.auth_failed);

        let mut seen = Vec::new();
        while let Some(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&StatusEvent::AuthFailed {
            reason: "credentials rejected".into()
        }));
        assert!(!seen.iter().any(|e| matches!(e, StatusEvent::Restarting { .. })));

        // Explicit re-initialization replaces the handle.
        session.initialize().await.unwrap();
        assert_eq!(connector.created(), 2);
        assert_eq!(connector.live(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_failure_funnels_into_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (session, connector) = spawn(&dir);
        connector.fail_next_starts(1);

        session.initialize().await.unwrap();
        settle().await;
        assert_eq!(session.snapshot().state, SessionState::Restarting);

        tokio::time::sleep(COOLDOWN + Duration::from_millis(10)).await;
        settle().await;
        assert_eq!(connector.created(), 2);
        assert_eq!(session.snapshot().state, SessionState::Initializing);
    }

    #[tokio::test(start_paused = true)]
    async fn create_failure_funnels_into_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (session, connector) = spawn(&dir);
        connector.fail_next_creates(1);

        session.initialize().await.unwrap();
        settle().await;
        assert_eq!(connector.created(), 0);
        assert_eq!(session.snapshot().state, SessionState::Restarting);

        tokio::time::sleep(COOLDOWN + Duration::from_millis(10)).await;
        settle().await;
        assert_eq!(connector.created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_failure_does_not_block_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (session, connector) = ready_session(&dir).await;
        connector.fail_destroy(true);

        connector.latest().unwrap().disconnect("conflict");
        settle().await;
        tokio::time::sleep(COOLDOWN + Duration::from_millis(10)).await;
        settle().await;
        assert_eq!(connector.created(), 2);
        assert_eq!(session.snapshot().state, SessionState::Initializing);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_events_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (session, connector) = ready_session(&dir).await;
        let first = connector.latest().unwrap();
        first.disconnect("NAVIGATION");
        settle().await;
        tokio::time::sleep(COOLDOWN + Duration::from_millis(10)).await;
        settle().await;

        first.ready();
        settle().await;
        assert!(!session.status().ready);
        assert_eq!(session.snapshot().generation, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_attempts_give_up() {
        let dir = tempfile::tempdir().unwrap();
        let connector = FakeConnector::new();
        let opts = SessionOptions {
            restart: RestartPolicy {
                max_attempts: Some(2),
                ..RestartPolicy::fixed(COOLDOWN)
            },
            ..options(&dir)
        };
        let session = WhatsAppSession::spawn(Arc::new(connector.clone()), opts);
        let mut events = session.subscribe();
        connector.fail_next_starts(10);

        session.initialize().await.unwrap();
        for _ in 0..4 {
            settle().await;
            tokio::time::sleep(COOLDOWN + Duration::from_millis(10)).await;
        }
        settle().await;

        assert_eq!(connector.created(), 3);
        assert_eq!(session.snapshot().state, SessionState::Disconnected);
        let mut exhausted = false;
        while let Some(event) = events.try_recv() {
            exhausted |= event == StatusEvent::RestartsExhausted { attempts: 2 };
        }
        assert!(exhausted);
        assert_eq!(connector.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_restarts_release_the_ready_handle() {
        let dir = tempfile::tempdir().unwrap();
        let connector = FakeConnector::new();
        let opts = SessionOptions {
            restart: RestartPolicy {
                max_attempts: Some(0),
                ..RestartPolicy::fixed(COOLDOWN)
            },
            ..options(&dir)
        };
        let session = WhatsAppSession::spawn(Arc::new(connector.clone()), opts);
        session.initialize().await.unwrap();
        let client = connector.latest().unwrap();
        client.ready();
        assert!(session.wait_until_ready(Duration::from_secs(1)).await);

        client.disconnect("NAVIGATION");
        settle().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;

        assert_eq!(session.snapshot().state, SessionState::Disconnected);
        assert!(client.is_destroyed());
        assert_eq!(connector.live(), 0);
        assert_eq!(connector.created(), 1);
    }

    #[tokio::test]
    async fn shutdown_destroys_transport_and_closes_handle() {
        let dir = tempfile::tempdir().unwrap();
        let (session, connector) = ready_session(&dir).await;

        session.shutdown().await;
        assert_eq!(connector.live(), 0);
        assert!(!session.status().ready);
        assert!(matches!(
            session.send("1555", "hi").await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn shutdown_tolerates_destroy_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (session, connector) = ready_session(&dir).await;
        connector.fail_destroy(true);
        session.shutdown().await;
        assert!(matches!(session.initialize().await, Err(SessionError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_restart_still_destroys_stale_handle() {
        let dir = tempfile::tempdir().unwrap();
        let (session, connector) = ready_session(&dir).await;
        let client = connector.latest().unwrap();

        client.disconnect("NAVIGATION");
        settle().await;
        session.shutdown().await;
        assert!(client.is_destroyed());

        tokio::time::sleep(COOLDOWN * 3).await;
        settle().await;
        assert_eq!(connector.live(), 0);
        assert_eq!(connector.created(), 1);
    }

    #[tokio::test]
    async fn dropping_last_handle_destroys_transport() {
        let dir = tempfile::tempdir().unwrap();
        let (session, connector) = ready_session(&dir).await;
        drop(session);
        for _ in 0..100 {
            if connector.live() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(connector.live(), 0);
    }

    #[tokio::test]
    async fn bounded_queue_reports_failure_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let opts = SessionOptions {
            queue_capacity: Some(1),
            ..options(&dir)
        };
        let session = WhatsAppSession::spawn(Arc::new(FakeConnector::new()), opts);
        assert_eq!(session.send("1", "a").await.unwrap().status, SendStatus::Queued);
        let report = session.send("1", "b").await.unwrap();
        assert_eq!(report.status, SendStatus::Failed);
        assert!(report.detail.unwrap().contains("full"));
    }
}
