//! HTTP surface for local observers
//!
//! - `GET /events` server-sent event stream fed by the broadcast hub
//! - `GET /health`, `GET /status` liveness and bridge status
//! - `GET /api/state`, `GET /api/tools`, `POST /api/call/{tool}` state service access

use crate::supervisor::BridgeSupervisor;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use futures_util::StreamExt;
use futures_util::stream::Stream;
use mcp_relay_broadcast::BroadcastHub;
use mcp_relay_core::event::timestamp;
use mcp_relay_core::{BridgeStatus, RelayError, Result, ServiceError, StateService, error_codes};
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Read access to the bridge status
pub trait StatusSource: Send + Sync + 'static {
    fn status(&self) -> BridgeStatus;
}

impl StatusSource for BridgeSupervisor {
    fn status(&self) -> BridgeStatus {
        self.get_status()
    }
}

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<BroadcastHub>,
    pub service: Arc<dyn StateService>,
    pub status: Arc<dyn StatusSource>,
}

impl AppState {
    /// State wired to a supervisor's hub and tool service
    pub fn from_supervisor(supervisor: Arc<BridgeSupervisor>) -> Self {
        Self {
            hub: supervisor.hub().clone(),
            service: supervisor.tools().clone(),
            status: supervisor,
        }
    }
}

/// Build the router with all routes
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/events", get(events_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/api/state", get(state_handler))
        .route("/api/tools", get(tools_handler))
        .route("/api/call/{tool}", post(call_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` is cancelled
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let addr = listener
        .local_addr()
        .map_err(|e| RelayError::IpcError(e.to_string()))?;
    info!(%addr, "HTTP server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| RelayError::IpcError(format!("HTTP server failed: {}", e)))
}

async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let subscription = state.hub.subscribe();
    Sse::new(subscription.map(|frame| Ok(Event::default().data(frame.as_ref()))))
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": timestamp(),
        "connectedClients": state.hub.subscriber_count(),
        "gameState": state.service.snapshot(),
    }))
}

async fn status_handler(State(state): State<AppState>) -> Json<BridgeStatus> {
    Json(state.status.status())
}

async fn state_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "success": true,
        "gameState": state.service.snapshot(),
    }))
}

async fn tools_handler(State(state): State<AppState>) -> Json<Value> {
    let tools: Vec<Value> = state
        .service
        .operations()
        .into_iter()
        .map(|name| json!({ "name": name }))
        .collect();
    Json(json!({ "tools": tools }))
}

#[derive(Debug, Default, Deserialize)]
struct CallBody {
    #[serde(default)]
    arguments: Option<Value>,
}

async fn call_handler(
    State(state): State<AppState>,
    Path(tool): Path<String>,
    body: Bytes,
) -> Response {
    let body: CallBody = if body.is_empty() {
        CallBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(body) => body,
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, format!("Invalid body: {}", e));
            }
        }
    };
    let arguments = body.arguments.unwrap_or_else(|| json!({}));

    match state.service.call(&tool, arguments).await {
        Ok(result) => Json(json!({ "result": result })).into_response(),
        Err(e) => {
            warn!(tool = %tool, "Tool call via HTTP failed: {}", e);
            error_response(status_for(&e), e.to_string())
        }
    }
}

fn status_for(error: &ServiceError) -> StatusCode {
    match error {
        ServiceError::Rejected { code, .. } if *code == i64::from(error_codes::METHOD_NOT_FOUND) => {
            StatusCode::NOT_FOUND
        }
        ServiceError::Rejected { .. } => StatusCode::BAD_REQUEST,
        ServiceError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ServiceError::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
