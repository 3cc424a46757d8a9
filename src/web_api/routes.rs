//! Control API routes

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};

use crate::config_store::CameraConfig;
use crate::error::{Error, Result};
use crate::models::{ApiResponse, CommandRequest};
use crate::state::AppState;
use crate::vendor_adapter::Channel;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/healthz", get(super::health_check))
        // Cameras
        .route("/api/cameras", get(list_cameras))
        .route("/api/cameras/:id", get(get_camera).put(update_camera))
        .route("/api/cameras/:id/replies", get(get_replies))
        .route("/api/cameras/:id/channels/:channel", post(send_command))
        // WebSocket
        .route("/api/ws", get(websocket_handler))
        .with_state(state)
}

// ========================================
// Camera Handlers
// ========================================

async fn list_cameras(State(state): State<AppState>) -> impl IntoResponse {
    let views: Vec<_> = state
        .sessions
        .list()
        .await
        .iter()
        .map(|s| s.view())
        .collect();
    Json(ApiResponse::success(views))
}

async fn get_camera(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.sessions.get(&id).await {
        Some(session) => Json(ApiResponse::success(session.view())).into_response(),
        None => Error::NotFound(format!("camera {}", id)).into_response(),
    }
}

/// Reply slots, for diagnosing what the camera actually answers
async fn get_replies(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let session = state
        .sessions
        .get(&id)
        .await
        .ok_or_else(|| Error::NotFound(format!("camera {}", id)))?;
    Ok(Json(ApiResponse::success(session.replies().snapshot())))
}

async fn update_camera(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(config): Json<CameraConfig>,
) -> Result<impl IntoResponse> {
    if config.camera_id != id {
        return Err(Error::Validation(format!(
            "body camera_id {} does not match {}",
            config.camera_id, id
        )));
    }
    let session = state
        .sessions
        .get(&id)
        .await
        .ok_or_else(|| Error::NotFound(format!("camera {}", id)))?;

    let old_port = session.config().server_port;
    let config = state.config_store.update_camera(config).await?;
    let new_port = config.server_port;
    session.reconfigure(config).await?;

    if old_port != new_port {
        let server = super::spawn_media_server(session.clone(), &state.config.host).await?;
        state.sessions.replace_media_server(&id, server).await?;
        tracing::info!(camera_id = %id, old_port, new_port, "Media server moved");
    }

    Ok(Json(ApiResponse::success(session.view())))
}

async fn send_command(
    State(state): State<AppState>,
    Path((id, channel)): Path<(String, String)>,
    Json(req): Json<CommandRequest>,
) -> Result<impl IntoResponse> {
    let channel: Channel = channel.parse()?;
    let session = state
        .sessions
        .get(&id)
        .await
        .ok_or_else(|| Error::NotFound(format!("camera {}", id)))?;

    session.handle_command(channel, req.value).await?;
    Ok(Json(ApiResponse::success(session.channel_value(channel))))
}

// ========================================
// WebSocket Handler
// ========================================

/// WebSocket upgrade handler
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let (conn_id, mut rx) = state.realtime.register().await;

    // Forward hub messages to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::warn!(connection_id = %conn_id, error = %e, "WebSocket error");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.realtime.unregister(&conn_id).await;
}
