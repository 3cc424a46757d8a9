//! ipcam-engine library
//!
//! Multi-vendor IP camera session engine with a small media server.
//!
//! ## Architecture
//!
//! 1. ConfigStore - camera inventory (JSON file)
//! 2. CameraSession - connection, auth, state and status per camera
//! 3. AuthNegotiator - HTTP Basic/Digest challenge handling
//! 4. ReplyStore - request/reply correlation
//! 5. PollingScheduler - health, high- and low-priority cadences
//! 6. VendorAdapter - ONVIF, Dahua/Amcrest, Foscam, Hikvision, Instar, DoorBird
//! 7. AlarmDebouncer - Idle/Active/CountingDown per channel
//! 8. MediaFanout - snapshot cache and MJPEG broadcast groups
//! 9. Transcoder - external ffmpeg for HLS/DASH/MJPEG
//! 10. SessionRegistry - active sessions
//! 11. RealtimeHub - WebSocket distribution
//! 12. WebAPI - control API and per-camera media server

pub mod alarm_debouncer;
pub mod auth_negotiator;
pub mod camera_session;
pub mod config_store;
pub mod error;
pub mod media_fanout;
pub mod models;
pub mod polling_scheduler;
pub mod realtime_hub;
pub mod reply_store;
pub mod session_registry;
pub mod state;
pub mod transcoder;
pub mod vendor_adapter;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
