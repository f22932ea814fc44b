//! WhatsApp session manager.
//!
//! Maintains exactly one authenticated transport connection for the process,
//! exposes the pairing QR code while the account is unlinked, and buffers
//! outbound text until the session is ready.
//!
//! Layout:
//! - `state`: pure state machine, `(state, input) -> effects`
//! - `session`: actor that owns the machine, the queue and the transport handle
//! - `supervisor`: teardown + cool-down + re-initialize after failures
//! - `transport`: the connector/client seam; `bridge` is the stdio implementation

pub mod address;
pub mod bridge;
pub mod channel;
pub mod error;
pub mod events;
#[cfg(any(test, feature = "test-support"))]
pub mod fake;
pub mod pairing;
pub mod queue;
pub mod session;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod transport;

pub use {
    address::ChatId,
    bridge::BridgeConnector,
    channel::WhatsAppChannel,
    error::SessionError,
    events::{StatusEvent, StatusEvents, StatusSubscription},
    pairing::{PairingArtifact, PairingLookup},
    session::{SendReport, SendStatus, SessionOptions, SessionSnapshot, StatusReport, WhatsAppSession},
    state::SessionState,
    store::CredentialStore,
    supervisor::RestartPolicy,
    transport::{
        ConnectContext, EventSink, TransportClient, TransportConnector, TransportError,
        TransportErrorKind, TransportEvent,
    },
};
