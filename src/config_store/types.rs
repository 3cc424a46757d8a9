//! ConfigStore data types
//!
//! Per-camera configuration as read from the cameras file

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::vendor_adapter::{AdapterContext, CameraBrand};

/// Allow-list value that lets every peer through
pub const ALLOW_LIST_DISABLED: &str = "DISABLE";

fn default_http_port() -> u16 {
    80
}

fn default_nvr_channel() -> u32 {
    1
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_low_priority_interval_ms() -> u64 {
    10_000
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_ip_whitelist() -> String {
    ALLOW_LIST_DISABLED.to_string()
}

fn default_true() -> bool {
    true
}

fn default_hls_output_options() -> String {
    "-strict -2 -f lavfi -i aevalsrc=0 -acodec aac -vcodec copy -hls_flags delete_segments -hls_time 2 -hls_list_size 4"
        .to_string()
}

fn default_dash_output_options() -> String {
    "-c:v copy -an -f dash -seg_duration 2 -window_size 4 -remove_at_exit 1".to_string()
}

fn default_mjpeg_output_options() -> String {
    "-q:v 5 -r 2 -vf scale=640:-2".to_string()
}

/// One camera (an entry of the cameras file)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub camera_id: String,
    pub brand: CameraBrand,
    pub address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// ONVIF service port; `None` uses the vendor's fixed URIs
    #[serde(default)]
    pub onvif_port: Option<u16>,
    /// Index into the device's media profiles
    #[serde(default)]
    pub onvif_profile: usize,
    /// 1-based NVR channel
    #[serde(default = "default_nvr_channel")]
    pub nvr_channel: u32,
    /// High-priority cadence
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_low_priority_interval_ms")]
    pub low_priority_interval_ms: u64,
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    /// Local media server port, 0 disables it
    #[serde(default)]
    pub server_port: u16,
    /// `(192.168.0.2)(192.168.0.3)`, comma separated addresses or `DISABLE`
    #[serde(default = "default_ip_whitelist")]
    pub ip_whitelist: String,
    #[serde(default)]
    pub snapshot_url: Option<String>,
    #[serde(default)]
    pub mjpeg_url: Option<String>,
    /// RTSP/HTTP input handed to the transcoder
    #[serde(default)]
    pub stream_url: Option<String>,
    /// Refresh the snapshot on every high-priority tick
    #[serde(default = "default_true")]
    pub snapshot_polling: bool,
    /// Reuse a digest nonce across requests instead of waiting for a new 401
    #[serde(default = "default_true")]
    pub reuse_digest_nonce: bool,
    #[serde(default)]
    pub ffmpeg_input_options: String,
    #[serde(default = "default_hls_output_options")]
    pub hls_output_options: String,
    #[serde(default = "default_dash_output_options")]
    pub dash_output_options: String,
    #[serde(default = "default_mjpeg_output_options")]
    pub mjpeg_output_options: String,
}

impl CameraConfig {
    /// Minimal config with every optional field at its default
    pub fn new(camera_id: impl Into<String>, brand: CameraBrand, address: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            brand,
            address: address.into(),
            port: default_http_port(),
            username: String::new(),
            password: String::new(),
            onvif_port: None,
            onvif_profile: 0,
            nvr_channel: default_nvr_channel(),
            poll_interval_ms: default_poll_interval_ms(),
            low_priority_interval_ms: default_low_priority_interval_ms(),
            health_interval_ms: default_health_interval_ms(),
            server_port: 0,
            ip_whitelist: default_ip_whitelist(),
            snapshot_url: None,
            mjpeg_url: None,
            stream_url: None,
            snapshot_polling: true,
            reuse_digest_nonce: true,
            ffmpeg_input_options: String::new(),
            hls_output_options: default_hls_output_options(),
            dash_output_options: default_dash_output_options(),
            mjpeg_output_options: default_mjpeg_output_options(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.camera_id.is_empty() || self.camera_id.len() > 64 {
            return Err(Error::Validation(
                "camera_id must be 1-64 characters".to_string(),
            ));
        }
        if self.address.trim().is_empty() {
            return Err(Error::Validation(format!(
                "camera {} has no address",
                self.camera_id
            )));
        }
        if self.nvr_channel == 0 {
            return Err(Error::Validation(format!(
                "camera {}: nvr_channel is 1-based",
                self.camera_id
            )));
        }
        if self.poll_interval_ms == 0
            || self.low_priority_interval_ms == 0
            || self.health_interval_ms == 0
        {
            return Err(Error::Validation(format!(
                "camera {}: intervals must be non-zero",
                self.camera_id
            )));
        }
        Ok(())
    }

    /// `http://address:port`
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }

    pub fn adapter_context(&self) -> AdapterContext {
        AdapterContext {
            username: self.username.clone(),
            password: self.password.clone(),
            nvr_channel: self.nvr_channel,
        }
    }

    /// Changes that invalidate the connection and auth context
    pub fn connection_changed(&self, other: &CameraConfig) -> bool {
        self.address != other.address
            || self.port != other.port
            || self.username != other.username
            || self.password != other.password
            || self.brand != other.brand
            || self.nvr_channel != other.nvr_channel
            || self.onvif_port != other.onvif_port
    }
}

/// Layout of the cameras file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CamerasFile {
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

impl CamerasFile {
    /// Validate every camera and reject duplicate ids
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for camera in &self.cameras {
            camera.validate()?;
            if !seen.insert(camera.camera_id.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate camera_id {}",
                    camera.camera_id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_json() {
        let json = r#"{"camera_id":"front","brand":"hikvision","address":"192.168.1.64"}"#;
        let camera: CameraConfig = serde_json::from_str(json).unwrap();
        assert_eq!(camera, CameraConfig::new("front", CameraBrand::Hikvision, "192.168.1.64"));
        assert_eq!(camera.base_url(), "http://192.168.1.64:80");
        assert!(camera.reuse_digest_nonce);
        assert_eq!(camera.ip_whitelist, ALLOW_LIST_DISABLED);
    }

    #[test]
    fn test_validation() {
        let mut camera = CameraConfig::new("front", CameraBrand::Dahua, "10.0.0.2");
        assert!(camera.validate().is_ok());

        camera.nvr_channel = 0;
        assert!(camera.validate().is_err());

        let camera = CameraConfig::new("", CameraBrand::Dahua, "10.0.0.2");
        assert!(camera.validate().is_err());

        let camera = CameraConfig::new("x", CameraBrand::Dahua, " ");
        assert!(camera.validate().is_err());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let file = CamerasFile {
            cameras: vec![
                CameraConfig::new("a", CameraBrand::Foscam, "10.0.0.2"),
                CameraConfig::new("a", CameraBrand::Foscam, "10.0.0.3"),
            ],
        };
        assert!(matches!(file.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_connection_changed() {
        let a = CameraConfig::new("a", CameraBrand::Foscam, "10.0.0.2");
        let mut b = a.clone();
        b.poll_interval_ms = 500;
        assert!(!a.connection_changed(&b));
        b.password = "new".to_string();
        assert!(a.connection_changed(&b));
    }
}
