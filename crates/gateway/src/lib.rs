//! Gateway: HTTP + WebSocket surface over the WhatsApp session.
//!
//! Lifecycle:
//! 1. Open the credential store, build the bridge connector
//! 2. Spawn the session and (optionally) initialize it
//! 3. Serve status/QR/send routes and the event WebSocket
//! 4. On shutdown, stop the server, then tear the session down

pub mod api;
pub mod server;
pub mod state;
pub mod ws;
