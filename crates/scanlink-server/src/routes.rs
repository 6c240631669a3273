//! HTTP handlers: websocket upgrade, live status surface, durable session
//! REST surface and health.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use scanlink_core::ids::SessionCode;
use scanlink_core::messages::now_timestamp;
use scanlink_store::StoreError;

use crate::server::AppState;
use crate::ws;

/// Error body for REST handlers.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::Store(e) => {
                tracing::error!(error = %e, "session store failure");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}

fn parse_code(raw: &str) -> Result<SessionCode, ApiError> {
    SessionCode::parse(raw).map_err(|e| ApiError::BadRequest(e.to_string()))
}

pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path((code, role)): Path<(String, String)>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| ws::serve_socket(socket, relay, code, role))
}

// ── Live status (connection table) ──────────────────────────────────────────

pub async fn live_session_status(
    Path(code): Path<String>,
    State(state): State<AppState>,
) -> Json<Value> {
    let occupancy = SessionCode::parse(&code)
        .map(|c| state.relay.table().occupancy(&c))
        .unwrap_or_default();
    Json(json!({
        "active": !occupancy.is_empty(),
        "session_id": code,
        "devices": occupancy.devices(),
        "host_connected": occupancy.host_connected,
        "client_connected": occupancy.client_connected,
        "timestamp": now_timestamp(),
    }))
}

pub async fn live_sessions(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.relay.table().sessions();
    Json(json!({
        "total_sessions": sessions.len(),
        "sessions": sessions,
        "timestamp": now_timestamp(),
    }))
}

// ── Durable sessions ────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

pub async fn create_session(
    State(state): State<AppState>,
    body: Option<Json<CreateSessionRequest>>,
) -> Result<Json<Value>, ApiError> {
    let requested = body.and_then(|Json(b)| b.session_id);
    let code = match requested.as_deref() {
        Some(raw) => parse_code(raw)?,
        None => SessionCode::generate(),
    };

    let lifecycle = state.relay.lifecycle();
    let joined = lifecycle.join_or_create(&code)?;
    let expires_at = lifecycle.touch(&code)?.unwrap_or(joined.record.expires_at);

    let mut body = json!({
        "success": true,
        "session_id": code,
        "expires_at": expires_at,
    });
    if joined.created {
        body["created"] = json!(true);
        body["message"] = json!("session created");
    } else {
        body["existing"] = json!(true);
        body["message"] = json!("session already exists");
    }
    Ok(Json(body))
}

pub async fn session_status(
    Path(code): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let code = parse_code(&code)?;
    let Some(record) = state.relay.lifecycle().status(&code)? else {
        return Ok(Json(json!({
            "exists": false,
            "active": false,
            "session_id": code,
            "message": "session not found",
        })));
    };
    Ok(Json(json!({
        "exists": true,
        "session_id": record.code,
        "active": record.is_live_at(chrono::Utc::now()),
        "host_connected": record.host_connected,
        "client_connected": record.client_connected,
        "created_at": record.created_at,
        "expires_at": record.expires_at,
    })))
}

pub async fn disconnect_session(
    Path(code): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let code = parse_code(&code)?;
    state.relay.lifecycle().deactivate(&code)?;
    let closed = state.relay.table().close_session(&code);
    tracing::info!(session_code = %code, closed_connections = closed, "session disconnected");
    Ok(Json(json!({
        "success": true,
        "session_id": code,
        "closed_connections": closed,
        "message": "session disconnected",
    })))
}

pub async fn active_sessions(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let records = state.relay.lifecycle().list_active()?;
    Ok(Json(json!({
        "success": true,
        "count": records.len(),
        "sessions": records,
    })))
}

// ── Misc ────────────────────────────────────────────────────────────────────

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let table = state.relay.table();
    Json(json!({
        "status": "healthy",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "connections": table.len(),
        "sessions": table.sessions().len(),
    }))
}

pub async fn root() -> Json<Value> {
    Json(json!({
        "service": "scanlink",
        "message": "ScanLink session-pairing relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
