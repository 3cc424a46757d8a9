//! Shared API models
//!
//! Request/response bodies used by the control API.

use serde::{Deserialize, Serialize};

use crate::vendor_adapter::ChannelValue;

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_sec: u64,
    pub cameras: usize,
    pub cameras_online: usize,
    pub ws_clients: u64,
}

/// Body of `POST /api/cameras/:id/channels/:channel`
#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    pub value: ChannelValue,
}
