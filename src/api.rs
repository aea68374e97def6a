//! HTTP API
//!
//! Read and write register values, list devices and stream live updates
//! over a websocket.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::decode::Value;
use crate::device::Gateway;
use crate::error::WriteError;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    /// Prometheus handle, `None` when metrics are disabled
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/:id/registers", get(list_registers))
        .route(
            "/api/devices/:id/registers/:name",
            get(get_register).put(write_register),
        )
        .route("/ws", get(ws_handler))
        .route("/metrics", get(render_metrics))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error body returned by every failing handler
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<WriteError> for ApiError {
    fn from(err: WriteError) -> Self {
        let status = match &err {
            WriteError::UnknownDevice(_) | WriteError::UnknownRegister(_) => StatusCode::NOT_FOUND,
            WriteError::NotWritable(_) => StatusCode::FORBIDDEN,
            WriteError::Encode { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            WriteError::Draining(_) => StatusCode::SERVICE_UNAVAILABLE,
            WriteError::ReadBack { .. } | WriteError::Transport { .. } => StatusCode::BAD_GATEWAY,
        };
        let message = match std::error::Error::source(&err) {
            Some(source) => format!("{err}: {source}"),
            None => err.to_string(),
        };
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "devices": state.gateway.device_ids().await.len(),
    }))
}

async fn list_devices(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gateway.device_ids().await)
}

async fn list_registers(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let device = state
        .gateway
        .device(&id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("unknown device `{id}`")))?;
    Ok(Json(device.snapshots().await))
}

async fn get_register(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let device = state
        .gateway
        .device(&id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("unknown device `{id}`")))?;
    let snapshot = device
        .get_value(&name)
        .await
        .ok_or_else(|| ApiError::not_found(format!("unknown register `{name}`")))?;
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    pub value: Value,
}

async fn write_register(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
    Json(request): Json<WriteRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .gateway
        .write_value(&id, &name, &request.value)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => ApiError::not_found("metrics are disabled").into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let updates = state.gateway.subscribe();
    ws.on_upgrade(move |socket| stream_updates(socket, updates))
}

/// Forward every register update to the client until either side closes.
async fn stream_updates(socket: WebSocket, mut updates: broadcast::Receiver<crate::store::RegisterUpdate>) {
    let (mut sender, mut receiver) = socket.split();
    info!("WebSocket client connected");

    let mut send_task = tokio::spawn(async move {
        loop {
            let update = match updates.recv().await {
                Ok(update) => update,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("WebSocket client lagged, missed {} updates", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let text = match serde_json::to_string(&update) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to serialize update: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }
    debug!("WebSocket client disconnected");
}
