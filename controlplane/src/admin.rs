//! Admin surface on its own port: health probes and the broadcast hub's
//! upgrade endpoint.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use tower_http::cors::{Any, CorsLayer};

use crate::hub::{ClientMessage, Hub};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    Router::new()
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Response {
    match state.db.ping().await {
        Ok(()) => Json(serde_json::json!({"status": "ok"})).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"status": "unavailable"})),
            )
                .into_response()
        }
    }
}

async fn health_detailed(State(state): State<AppState>) -> Response {
    let storage = match state.db.ping().await {
        Ok(()) => "ok",
        Err(_) => "unavailable",
    };
    let overall = if storage == "ok" { "ok" } else { "degraded" };
    Json(serde_json::json!({
        "status": overall,
        "components": {
            "storage": storage,
            "hub": "ok",
            "kubernetes": if state.workloads.is_some() { "attached" } else { "detached" },
        }
    }))
    .into_response()
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !state.hub.origin_allowed(origin) {
        tracing::warn!(origin = ?origin, "websocket origin rejected");
        return StatusCode::FORBIDDEN.into_response();
    }
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

/// One reader and one writer per observer. The writer drains the client's
/// bounded hub queue; the reader feeds inbound control messages back.
async fn handle_socket(socket: WebSocket, hub: Hub) {
    let (mut sink, mut stream) = socket.split();
    let (client_id, outbound) = hub.connect().await;
    tracing::info!(client = client_id, "observer connected");

    let writer = tokio::spawn(async move {
        while let Ok(message) = outbound.recv().await {
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                // Unparseable or unknown frames are ignored, never fatal.
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => hub.handle_client_message(client_id, message).await,
                    Err(e) => tracing::debug!(client = client_id, error = %e, "ignoring frame"),
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            // Pings are answered at the protocol layer; binary is ignored.
            Ok(_) => {}
        }
    }

    hub.disconnect(client_id).await;
    writer.abort();
    tracing::info!(client = client_id, "observer disconnected");
}
