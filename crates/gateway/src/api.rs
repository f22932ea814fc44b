//! `/api/whatsapp/*` handlers.

use std::sync::Arc;

use {
    axum::{
        Json,
        extract::State,
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    pairgate_whatsapp::{PairingLookup, SendStatus, SessionError},
    serde::{Deserialize, Serialize},
    serde_json::json,
    tracing::warn,
};

use crate::state::GatewayState;

/// Error body: `{"error": "..."}` with a status derived from the session error.
#[derive(Debug)]
pub struct ApiError(SessionError);

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_validation() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub async fn init_handler(
    State(state): State<Arc<GatewayState>>,
) -> Result<impl IntoResponse, ApiError> {
    let current = state.session.initialize().await?;
    Ok(Json(json!({ "state": current })))
}

pub async fn status_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let snap = state.session.snapshot();
    Json(json!({ "ready": snap.ready, "state": snap.state }))
}

pub async fn qr_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    match state.session.pairing_artifact() {
        PairingLookup::Available(qr) => Json(json!({ "qr": qr })),
        PairingLookup::Unavailable => Json(json!({
            "unavailable": true,
            "message": "QR not generated yet",
        })),
    }
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub number: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
struct SendResponse {
    status: SendStatus,
    number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

pub async fn send_handler(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<SendRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state.session.send(&req.number, &req.message).await?;
    if report.status == SendStatus::Failed {
        warn!(to = %report.recipient, detail = ?report.detail, "send request failed");
    }
    Ok(Json(SendResponse {
        status: report.status,
        number: report.recipient.to_string(),
        detail: report.detail,
    }))
}
