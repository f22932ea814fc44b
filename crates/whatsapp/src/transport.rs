//! Transport seam: the connection primitive the session drives but does not own.

use std::{fmt, path::PathBuf, sync::Arc};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    thiserror::Error,
    tokio::sync::mpsc,
};

use crate::address::ChatId;

/// Failure categories reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// The remote session is gone; the handle is unusable.
    SessionClosed,
    /// The link to the transport process/socket dropped.
    ConnectionLost,
    /// The transport refused this particular request.
    Rejected,
    Timeout,
    /// Malformed traffic between core and transport.
    Protocol,
    Io,
}

impl TransportErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionClosed => "session closed",
            Self::ConnectionLost => "connection lost",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
            Self::Protocol => "protocol error",
            Self::Io => "io error",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Categorize an untyped error string from a transport that reports no kind.
    ///
    /// Browser-backed clients only say "Session closed" in the message text when
    /// the page died under them, so that substring is the fatal marker.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = if message.contains("Session closed") {
            TransportErrorKind::SessionClosed
        } else {
            TransportErrorKind::Rejected
        };
        Self { kind, message }
    }

    /// Whether the underlying connection is gone and the session must restart.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::SessionClosed | TransportErrorKind::ConnectionLost
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::new(TransportErrorKind::Io, e.to_string())
    }
}

/// Lifecycle notifications emitted by a transport client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A fresh pairing code (raw string, not yet rendered).
    PairingCode(String),
    Ready,
    Disconnected(String),
    AuthFailure(String),
    /// Informational state string from the transport. Logged only.
    StateChanged(String),
}

/// Sender half handed to each transport client.
///
/// Every event is tagged with the generation of the client it was given to,
/// so the session can drop events from handles it already replaced.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { generation, tx }
    }

    /// A standalone sink plus its receiver.
    pub fn channel(generation: u64) -> (Self, mpsc::UnboundedReceiver<(u64, TransportEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(generation, tx), rx)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the session has gone away.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// Everything a connector needs to build one client.
#[derive(Debug, Clone)]
pub struct ConnectContext {
    pub generation: u64,
    pub client_id: String,
    /// Credential directory; created before the first connect.
    pub auth_dir: PathBuf,
    pub events: EventSink,
}

/// Builds transport clients. `create` must not perform I/O: the session
/// stores the handle before it calls [`TransportClient::start`].
pub trait TransportConnector: Send + Sync {
    fn create(&self, ctx: ConnectContext) -> Result<Arc<dyn TransportClient>, TransportError>;
}

/// One live connection to the chat network.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Begin connecting. Lifecycle progress is reported through the [`EventSink`].
    async fn start(&self) -> Result<(), TransportError>;

    async fn send_text(&self, to: &ChatId, text: &str) -> Result<(), TransportError>;

    /// Release the connection. Must be safe to call on a client that never started.
    async fn destroy(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_detects_closed_session() {
        let err = TransportError::classify("Protocol error: Session closed. Most likely the page has been closed.");
        assert_eq!(err.kind, TransportErrorKind::SessionClosed);
        assert!(err.is_fatal());
    }

    #[test]
    fn classify_other_text_is_not_fatal() {
        let err = TransportError::classify("invalid wid");
        assert_eq!(err.kind, TransportErrorKind::Rejected);
        assert!(!err.is_fatal());
    }

    #[test]
    fn only_connection_kinds_are_fatal() {
        assert!(TransportError::new(TransportErrorKind::ConnectionLost, "eof").is_fatal());
        assert!(!TransportError::new(TransportErrorKind::Timeout, "slow").is_fatal());
        assert!(!TransportError::new(TransportErrorKind::Io, "x").is_fatal());
    }

    #[test]
    fn sink_tags_generation() {
        let (sink, mut rx) = EventSink::channel(7);
        assert!(sink.emit(TransportEvent::Ready));
        assert_eq!(rx.try_recv().unwrap(), (7, TransportEvent::Ready));
        drop(rx);
        assert!(!sink.emit(TransportEvent::Ready));
    }

    #[test]
    fn error_display_includes_kind() {
        let err = TransportError::new(TransportErrorKind::SessionClosed, "page gone");
        assert_eq!(err.to_string(), "session closed: page gone");
    }
}
