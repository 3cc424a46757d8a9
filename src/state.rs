//! Application state
//!
//! Holds all shared components and state

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::camera_session::{CameraSession, SessionSettings};
use crate::config_store::{CameraConfig, ConfigStore};
use crate::error::Result;
use crate::realtime_hub::RealtimeHub;
use crate::session_registry::SessionRegistry;
use crate::web_api;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Control API host
    pub host: String,
    /// Control API port
    pub port: u16,
    /// Camera inventory (JSON)
    pub cameras_file: PathBuf,
    pub ffmpeg_path: String,
    /// Transcoder output root, one subdirectory per camera
    pub media_dir: PathBuf,
    pub request_timeout_ms: u64,
    /// Silence tolerated on camera event streams and MJPEG relays
    pub stream_idle_timeout_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            cameras_file: std::env::var("CAMERAS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/etc/ipcam-engine/cameras.json")),
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            media_dir: std::env::var("MEDIA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/var/lib/ipcam-engine/media")),
            request_timeout_ms: std::env::var("REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(5000),
            stream_idle_timeout_ms: std::env::var("STREAM_IDLE_TIMEOUT_MS")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(30_000),
        }
    }
}

impl AppConfig {
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            ffmpeg_path: self.ffmpeg_path.clone(),
            media_dir: self.media_dir.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            stream_idle_timeout: Duration::from_millis(self.stream_idle_timeout_ms),
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    /// ConfigStore (camera inventory)
    pub config_store: Arc<ConfigStore>,
    /// Active camera sessions
    pub sessions: Arc<SessionRegistry>,
    /// RealtimeHub (WebSocket)
    pub realtime: Arc<RealtimeHub>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, config_store: Arc<ConfigStore>) -> Self {
        Self {
            config,
            config_store,
            sessions: Arc::new(SessionRegistry::new()),
            realtime: Arc::new(RealtimeHub::new()),
            started_at: Instant::now(),
        }
    }

    /// Create, start and register a session with its media server
    pub async fn start_camera(&self, camera: CameraConfig) -> Result<Arc<CameraSession>> {
        let session = CameraSession::new(
            camera,
            self.config.session_settings(),
            self.realtime.clone(),
        )?;
        let media_server = web_api::spawn_media_server(session.clone(), &self.config.host).await?;
        session.start();
        self.sessions.insert(session.clone(), media_server).await?;
        Ok(session)
    }

    /// Start every camera in the store; a camera that fails is logged and skipped
    pub async fn start_all(&self) -> usize {
        let mut started = 0;
        for camera in self.config_store.list_cameras().await {
            let camera_id = camera.camera_id.clone();
            match self.start_camera(camera).await {
                Ok(_) => started += 1,
                Err(e) => {
                    tracing::error!(camera_id = %camera_id, error = %e, "Failed to start camera session")
                }
            }
        }
        started
    }
}
