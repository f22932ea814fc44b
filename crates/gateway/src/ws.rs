//! Event push: forwards every status event to a WebSocket client as JSON.

use std::sync::Arc;

use {
    axum::extract::ws::{Message, WebSocket},
    futures::{SinkExt, StreamExt},
    serde_json::json,
    tracing::{debug, info, warn},
};

use crate::state::GatewayState;

/// Drive one event connection until either side goes away.
///
/// The first frame is `{"type":"snapshot",...}` with the current session
/// view; every following frame is a serialized `StatusEvent`.
pub async fn handle_events(socket: WebSocket, state: Arc<GatewayState>) {
    let mut events = state.session.subscribe();
    let clients = state.event_client_opened();
    info!(clients, "event client connected");

    let (mut tx, mut rx) = socket.split();

    let snapshot = json!({ "type": "snapshot", "session": state.session.snapshot() });
    if tx.send(Message::Text(snapshot.to_string().into())).await.is_err() {
        state.event_client_closed();
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let frame = match serde_json::to_string(&event) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize status event");
                        continue;
                    },
                };
                if tx.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            },
            incoming = rx.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(error = %e, "event socket error");
                    break;
                },
                Some(Ok(_)) => {},
            },
        }
    }

    state.event_client_closed();
    info!("event client disconnected");
}
