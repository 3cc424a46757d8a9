//! ipcam-engine
//!
//! Main entry point: loads the camera inventory, starts one session per
//! camera and serves the control API.

use std::sync::Arc;

use ipcam_engine::{
    config_store::{ConfigRepository, ConfigStore},
    state::{AppConfig, AppState},
    web_api,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ipcam_engine=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting ipcam-engine v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::default();
    tracing::info!(
        cameras_file = %config.cameras_file.display(),
        media_dir = %config.media_dir.display(),
        ffmpeg_path = %config.ffmpeg_path,
        request_timeout_ms = config.request_timeout_ms,
        stream_idle_timeout_ms = config.stream_idle_timeout_ms,
        "Configuration loaded"
    );

    let config_store = Arc::new(ConfigStore::load(ConfigRepository::new(config.cameras_file.clone())).await?);
    tokio::fs::create_dir_all(&config.media_dir).await?;

    let state = AppState::new(config, config_store);
    let started = state.start_all().await;
    tracing::info!(started, "Camera sessions started");

    let app = web_api::create_router(state.clone())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let sessions = state.sessions.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("Shutting down");
    sessions.stop_all().await;

    Ok(())
}
