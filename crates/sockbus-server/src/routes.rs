//! axum glue: upgrade handler and health endpoint.

use std::collections::HashMap;

use axum::Router;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use serde_json::Value;
use tracing::{debug, warn};

use crate::server::Server;
use crate::session::Metadata;
use crate::transport::Connection;

/// Router serving the bus at `path` plus `GET /health`.
///
/// Query parameters of the upgrade request become the session's metadata.
pub fn ws_router(server: Server, path: &str) -> Router {
    Router::new()
        .route(path, get(upgrade_handler))
        .route("/health", get(health_handler))
        .with_state(server)
}

async fn upgrade_handler(
    State(server): State<Server>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let metadata: Metadata = params
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();

    // Oversized messages fail the read instead of being buffered in full.
    let limit = server.settings().max_message_size;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| async move {
            match server
                .serve_connection(Connection::from_axum(socket), metadata)
                .await
            {
                Ok(session) => debug!(session_id = %session.id(), "websocket admitted"),
                Err(e) => warn!(error = %e, "websocket admission failed"),
            }
        })
        .into_response()
}

async fn health_handler(State(server): State<Server>) -> impl IntoResponse {
    let sessions = server.session_count().await.ok();
    Json(serde_json::json!({
        "status": if sessions.is_some() { "ok" } else { "stopped" },
        "sessions": sessions,
    }))
}
