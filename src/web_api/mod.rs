//! WebAPI - HTTP endpoints
//!
//! ## Responsibilities
//!
//! - Control API: camera status, reconfigure, commands, WebSocket feed
//! - Per-camera media server: snapshots, MJPEG streams, transcoder output,
//!   inbound camera pushes

mod media_routes;
mod routes;

pub use media_routes::{media_router, serve_media, spawn_media_server};
pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.sessions.list().await;
    let online = sessions.iter().filter(|s| s.status().is_online()).count();

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_sec: state.started_at.elapsed().as_secs(),
        cameras: sessions.len(),
        cameras_online: online,
        ws_clients: state.realtime.connection_count(),
    })
}
