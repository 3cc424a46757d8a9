//! RealtimeHub - WebSocket distribution
//!
//! ## Responsibilities
//!
//! - WebSocket client registration
//! - Broadcasting canonical channel updates and session status transitions
//! - Snapshot update notifications
//!
//! Note: only snapshot update NOTIFICATIONS are sent (camera_id + size).
//! Image data is fetched from the camera's media server at `/ipcamera.jpg`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::camera_session::SessionStatus;
use crate::vendor_adapter::{CameraBrand, Channel, ChannelValue};

/// Hub message types
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum HubMessage {
    ChannelUpdate(ChannelUpdateMessage),
    StatusChanged(StatusChangedMessage),
    /// A new snapshot is cached for the camera
    SnapshotUpdated(SnapshotUpdatedMessage),
}

impl HubMessage {
    fn kind(&self) -> &'static str {
        match self {
            HubMessage::ChannelUpdate(_) => "channel_update",
            HubMessage::StatusChanged(_) => "status_changed",
            HubMessage::SnapshotUpdated(_) => "snapshot_updated",
        }
    }
}

/// Canonical channel state change
#[derive(Debug, Clone, Serialize)]
pub struct ChannelUpdateMessage {
    pub camera_id: String,
    pub channel: Channel,
    pub value: ChannelValue,
    pub vendor: CameraBrand,
    pub timestamp: String,
}

/// Session status transition
#[derive(Debug, Clone, Serialize)]
pub struct StatusChangedMessage {
    pub camera_id: String,
    pub status: SessionStatus,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotUpdatedMessage {
    pub camera_id: String,
    pub bytes: usize,
    pub timestamp: String,
}

/// Client connection
struct ClientConnection {
    id: Uuid,
    tx: mpsc::UnboundedSender<String>,
}

/// RealtimeHub instance
pub struct RealtimeHub {
    connections: RwLock<HashMap<Uuid, ClientConnection>>,
    connection_count: AtomicU64,
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            connection_count: AtomicU64::new(0),
        }
    }

    /// Register a new client
    pub async fn register(&self) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        self.connections
            .write()
            .await
            .insert(id, ClientConnection { id, tx });
        self.connection_count.fetch_add(1, Ordering::Relaxed);

        tracing::info!(connection_id = %id, "Client connected");

        (id, rx)
    }

    /// Unregister a client
    pub async fn unregister(&self, id: &Uuid) {
        let mut connections = self.connections.write().await;
        if connections.remove(id).is_some() {
            self.connection_count.fetch_sub(1, Ordering::Relaxed);
            tracing::info!(connection_id = %id, "Client disconnected");
        }
    }

    /// Broadcast message to all clients
    pub async fn broadcast(&self, message: HubMessage) {
        let json = match serde_json::to_string(&message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize message");
                return;
            }
        };

        let connections = self.connections.read().await;
        tracing::trace!(
            message_type = %message.kind(),
            client_count = connections.len(),
            "Broadcasting message to clients"
        );

        for conn in connections.values() {
            if let Err(e) = conn.tx.send(json.clone()) {
                tracing::warn!(connection_id = %conn.id, error = %e, "Failed to send message");
            }
        }
    }

    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_registered_clients() {
        let hub = RealtimeHub::new();
        let (a, mut rx_a) = hub.register().await;
        let (_b, mut rx_b) = hub.register().await;
        assert_eq!(hub.connection_count(), 2);

        hub.broadcast(HubMessage::ChannelUpdate(ChannelUpdateMessage {
            camera_id: "front".to_string(),
            channel: Channel::MotionAlarm,
            value: ChannelValue::Switch(true),
            vendor: CameraBrand::Dahua,
            timestamp: "2024-05-01T10:00:00Z".to_string(),
        }))
        .await;

        let json: serde_json::Value = serde_json::from_str(&rx_a.recv().await.unwrap()).unwrap();
        assert_eq!(json["type"], "channel_update");
        assert_eq!(json["data"]["channel"], "motion_alarm");
        assert_eq!(json["data"]["value"], true);
        assert!(rx_b.recv().await.is_some());

        hub.unregister(&a).await;
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_status_serialisation() {
        let hub = RealtimeHub::new();
        let (_id, mut rx) = hub.register().await;
        hub.broadcast(HubMessage::StatusChanged(StatusChangedMessage {
            camera_id: "front".to_string(),
            status: SessionStatus::Online,
            timestamp: String::new(),
        }))
        .await;
        let json: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(json["data"]["status"]["status"], "ONLINE");
    }
}
