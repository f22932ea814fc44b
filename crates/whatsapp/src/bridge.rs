//! Stdio bridge transport: drive an external WhatsApp Web client process
//! that speaks line-delimited JSON over stdin/stdout.
//!
//! Client to bridge, one object per line:
//!
//! ```text
//! {"id":1,"method":"send","params":{"to":"15551234567@c.us","text":"hi"}}
//! {"id":2,"method":"destroy"}
//! ```
//!
//! Bridge to client, replies carry the request id; everything else is a
//! lifecycle event tagged by `type`:
//!
//! ```text
//! {"id":1,"ok":true}
//! {"id":1,"ok":false,"error":{"kind":"session_closed","message":"..."}}
//! {"type":"qr","code":"2@..."}
//! {"type":"ready"}
//! {"type":"disconnected","reason":"NAVIGATION"}
//! {"type":"auth_failure","message":"..."}
//! {"type":"state","state":"CONFLICT"}
//! ```
//!
//! The bridge is launched as `<command> <args..> --auth-dir <dir> --client-id <id>`
//! and is expected to start connecting immediately.

use std::{
    collections::HashMap,
    path::PathBuf,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    pairgate_config::BridgeConfig,
    serde::{Deserialize, Serialize},
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        process::{Child, ChildStdin, ChildStdout, Command},
        sync::{Mutex, oneshot},
        task::JoinHandle,
    },
    tracing::{debug, trace, warn},
};

use crate::{
    address::ChatId,
    transport::{
        ConnectContext, EventSink, TransportClient, TransportConnector, TransportError,
        TransportErrorKind, TransportEvent,
    },
};

/// How long a bridge gets to exit after `destroy` before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(2);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<(), TransportError>>>>>;

/// Launches one bridge process per transport generation.
#[derive(Debug, Clone)]
pub struct BridgeConnector {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    request_timeout: Duration,
}

impl BridgeConnector {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(cfg: &BridgeConfig, request_timeout: Duration) -> Self {
        Self {
            command: cfg.command.clone(),
            args: cfg.args.clone(),
            env: cfg.env.clone(),
            request_timeout,
        }
    }
}

impl TransportConnector for BridgeConnector {
    fn create(&self, ctx: ConnectContext) -> Result<Arc<dyn TransportClient>, TransportError> {
        Ok(Arc::new(BridgeClient {
            connector: self.clone(),
            generation: ctx.generation,
            client_id: ctx.client_id,
            auth_dir: ctx.auth_dir,
            events: ctx.events,
            process: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }))
    }
}

struct BridgeProcess {
    child: Child,
    stdin: ChildStdin,
    reader: JoinHandle<()>,
}

/// One bridge process. Spawned by `start`, killed by `destroy` or on drop.
pub struct BridgeClient {
    connector: BridgeConnector,
    generation: u64,
    client_id: String,
    auth_dir: PathBuf,
    events: EventSink,
    process: Mutex<Option<BridgeProcess>>,
    pending: Pending,
    next_id: AtomicU64,
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<SendParams<'a>>,
}

#[derive(Debug, Serialize)]
struct SendParams<'a> {
    to: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(untagged)]
enum Inbound {
    Reply(Reply),
    Event(BridgeEvent),
}

#[derive(Debug, Deserialize, PartialEq)]
struct Reply {
    id: u64,
    ok: bool,
    #[serde(default)]
    error: Option<ReplyError>,
}

#[derive(Debug, Deserialize, PartialEq)]
struct ReplyError {
    #[serde(default)]
    kind: Option<TransportErrorKind>,
    message: String,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeEvent {
    Qr { code: String },
    Ready,
    Disconnected { reason: String },
    AuthFailure { message: String },
    State { state: String },
}

impl From<BridgeEvent> for TransportEvent {
    fn from(event: BridgeEvent) -> Self {
        match event {
            BridgeEvent::Qr { code } => Self::PairingCode(code),
            BridgeEvent::Ready => Self::Ready,
            BridgeEvent::Disconnected { reason } => Self::Disconnected(reason),
            BridgeEvent::AuthFailure { message } => Self::AuthFailure(message),
            BridgeEvent::State { state } => Self::StateChanged(state),
        }
    }
}

impl Reply {
    fn into_result(self) -> Result<(), TransportError> {
        if self.ok {
            return Ok(());
        }
        Err(match self.error {
            Some(ReplyError {
                kind: Some(kind),
                message,
            }) => TransportError::new(kind, message),
            Some(ReplyError {
                kind: None,
                message,
            }) => TransportError::classify(message),
            None => TransportError::new(TransportErrorKind::Protocol, "request failed without detail"),
        })
    }
}

fn parse_line(line: &str) -> Result<Inbound, serde_json::Error> {
    serde_json::from_str(line)
}

fn bridge_gone() -> TransportError {
    TransportError::new(TransportErrorKind::ConnectionLost, "bridge exited")
}

async fn read_loop(stdout: ChildStdout, events: EventSink, pending: Pending) {
    let generation = events.generation();
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!(generation, "bridge stdout closed");
                break;
            },
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                trace!(generation, raw = %trimmed, "bridge -> client");
                match parse_line(trimmed) {
                    Ok(Inbound::Reply(reply)) => {
                        let id = reply.id;
                        if let Some(tx) = pending.lock().await.remove(&id) {
                            let _ = tx.send(reply.into_result());
                        } else {
                            warn!(generation, id, "reply for unknown bridge request");
                        }
                    },
                    Ok(Inbound::Event(event)) => {
                        events.emit(event.into());
                    },
                    Err(e) => warn!(generation, error = %e, "unparseable bridge output"),
                }
            },
            Err(e) => {
                warn!(generation, error = %e, "error reading bridge stdout");
                break;
            },
        }
    }

    for (_, tx) in pending.lock().await.drain() {
        let _ = tx.send(Err(bridge_gone()));
    }
    events.emit(TransportEvent::Disconnected("bridge exited".into()));
}

impl BridgeClient {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.connector.command);
        cmd.args(&self.connector.args)
            .arg("--auth-dir")
            .arg(&self.auth_dir)
            .arg("--client-id")
            .arg(&self.client_id)
            .envs(&self.connector.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }

    async fn write_line(stdin: &mut ChildStdin, request: &Request<'_>) -> Result<(), TransportError> {
        let mut payload = serde_json::to_string(request)
            .map_err(|e| TransportError::new(TransportErrorKind::Protocol, e.to_string()))?;
        payload.push('\n');
        stdin.write_all(payload.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl TransportClient for BridgeClient {
    async fn start(&self) -> Result<(), TransportError> {
        let mut slot = self.process.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let mut child = self.command().spawn().map_err(|e| {
            TransportError::new(
                TransportErrorKind::Io,
                format!("failed to spawn bridge {}: {e}", self.connector.command),
            )
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill().await;
            return Err(TransportError::new(
                TransportErrorKind::Io,
                "failed to capture bridge stdio",
            ));
        };
        debug!(generation = self.generation, pid = ?child.id(), "bridge spawned");

        let reader = tokio::spawn(read_loop(
            stdout,
            self.events.clone(),
            Arc::clone(&self.pending),
        ));
        *slot = Some(BridgeProcess {
            child,
            stdin,
            reader,
        });
        Ok(())
    }

    async fn send_text(&self, to: &ChatId, text: &str) -> Result<(), TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self.process.lock().await;
            let Some(process) = slot.as_mut() else {
                return Err(TransportError::new(
                    TransportErrorKind::ConnectionLost,
                    "bridge not running",
                ));
            };
            self.pending.lock().await.insert(id, tx);
            let request = Request {
                id,
                method: "send",
                params: Some(SendParams {
                    to: to.as_str(),
                    text,
                }),
            };
            trace!(generation = self.generation, id, "client -> bridge");
            if let Err(e) = Self::write_line(&mut process.stdin, &request).await {
                self.pending.lock().await.remove(&id);
                return Err(e);
            }
        }

        match tokio::time::timeout(self.connector.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(bridge_gone()),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(TransportError::new(
                    TransportErrorKind::Timeout,
                    format!("bridge did not answer within {:?}", self.connector.request_timeout),
                ))
            },
        }
    }

    async fn destroy(&self) -> Result<(), TransportError> {
        let Some(BridgeProcess {
            mut child,
            mut stdin,
            reader,
        }) = self.process.lock().await.take()
        else {
            return Ok(());
        };
        // The session is tearing this handle down; no exit event is wanted.
        reader.abort();

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = Request {
            id,
            method: "destroy",
            params: None,
        };
        if let Err(e) = Self::write_line(&mut stdin, &request).await {
            debug!(generation = self.generation, error = %e, "bridge stdin already closed");
        }
        drop(stdin);

        for (_, tx) in self.pending.lock().await.drain() {
            let _ = tx.send(Err(bridge_gone()));
        }

        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(generation = self.generation, %status, "bridge exited");
                Ok(())
            },
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                warn!(generation = self.generation, "bridge did not exit in time, killing");
                child.kill().await.map_err(TransportError::from)
            },
        }
    }
}
