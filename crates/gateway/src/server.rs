use std::{net::SocketAddr, sync::Arc};

use {
    anyhow::Context,
    axum::{
        Router,
        extract::{State, WebSocketUpgrade},
        response::{IntoResponse, Json},
        routing::{get, post},
    },
    pairgate_config::{PairgateConfig, WhatsAppConfig},
    pairgate_whatsapp::{BridgeConnector, CredentialStore, SessionOptions, WhatsAppSession},
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{info, warn},
};

use crate::{api, state::GatewayState, ws::handle_events};

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/whatsapp/init", post(api::init_handler))
        .route("/api/whatsapp/status", get(api::status_handler))
        .route("/api/whatsapp/qr", get(api::qr_handler))
        .route("/api/whatsapp/send", post(api::send_handler))
        .route("/api/whatsapp/events", get(events_upgrade_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Open the credential store and spawn a bridge-backed session. The session
/// is left uninitialized.
pub fn spawn_session(wa: &WhatsAppConfig) -> anyhow::Result<WhatsAppSession> {
    let auth_dir = wa.resolved_auth_dir(&pairgate_config::data_dir());
    let store = CredentialStore::open(&auth_dir)
        .with_context(|| format!("failed to open credential store at {}", auth_dir.display()))?;
    let connector = BridgeConnector::from_config(&wa.bridge, wa.send_timeout());
    Ok(WhatsAppSession::spawn(
        Arc::new(connector),
        SessionOptions::from_config(wa, store),
    ))
}

/// Spawn the WhatsApp session from `config` and serve until `shutdown`
/// resolves. The session is torn down after the server stops.
pub async fn start_gateway(
    config: PairgateConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let wa = &config.whatsapp;

    // Bind before the session exists so a bad address leaves nothing running.
    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.gateway.bind, config.gateway.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let session = spawn_session(wa)?;
    let state = GatewayState::new(session.clone());

    if wa.auto_start {
        match session.initialize().await {
            Ok(current) => info!(state = %current, "whatsapp session initializing"),
            Err(e) => {
                session.shutdown().await;
                return Err(e.into());
            },
        }
    }

    let app = build_gateway_app(Arc::clone(&state));

    // Startup banner.
    let lines = [
        format!("pairgate gateway v{}", state.version),
        format!("listening on {addr}"),
        format!("whatsapp client: {}", wa.client_id),
        format!(
            "auth dir: {}",
            wa.resolved_auth_dir(&pairgate_config::data_dir()).display()
        ),
        format!("bridge: {}", wa.bridge.command),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;
    if let Err(e) = &served {
        warn!(error = %e, "gateway server stopped with error");
    }

    info!(uptime = ?state.started_at.elapsed(), "gateway stopped, closing whatsapp session");
    session.shutdown().await;
    served.map_err(Into::into)
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": state.version,
        "ready": state.session.status().ready,
        "event_clients": state.event_client_count(),
    }))
}

async fn events_upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events(socket, state))
}
