//! HTTP POST and WebSocket adapters over the shared dispatcher.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use mcp_hostd_proto::envelope::PARSE_ERROR;
use mcp_hostd_proto::JsonRpcResponse;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, warn};

use crate::protocol::McpDispatcher;
use crate::registry::PluginRegistry;

pub struct AppState {
    pub dispatcher: Arc<McpDispatcher>,
    pub registry: Arc<PluginRegistry>,
    pub server_version: String,
}

/// Routes shared by every transport entry point. Cross-origin access is
/// permissive for local tooling.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/mcp", post(mcp_post))
        .route("/health", get(health))
        .route("/mcp/ws", get(ws_upgrade))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn mcp_post(State(state): State<Arc<AppState>>, body: String) -> Response {
    match serde_json::from_str::<Value>(&body) {
        Ok(value) => match state.dispatcher.dispatch_value(value).await {
            Some(reply) => Json(reply).into_response(),
            None => StatusCode::NO_CONTENT.into_response(),
        },
        Err(e) => {
            debug!(error = %e, "request body failed to decode");
            Json(JsonRpcResponse::error(
                None,
                PARSE_ERROR,
                format!("Parse error: {e}"),
            ))
            .into_response()
        }
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": state.server_version,
        "timestamp": Utc::now().to_rfc3339(),
        "plugins": state.registry.list_plugins(),
    }))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Per-connection message loop; each text frame is one envelope. The
/// connection's lifetime is independent of in-flight operations.
async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    while let Some(message) = socket.recv().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "websocket receive error");
                break;
            }
        };
        match message {
            Message::Text(text) => {
                let reply = match serde_json::from_str::<Value>(&text) {
                    Ok(value) => state.dispatcher.dispatch_value(value).await,
                    Err(e) => Some(JsonRpcResponse::error(
                        None,
                        PARSE_ERROR,
                        format!("Parse error: {e}"),
                    )),
                };
                let Some(reply) = reply else { continue };
                match serde_json::to_string(&reply) {
                    Ok(payload) => {
                        if socket.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to serialize response"),
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    debug!("websocket connection closed");
}
