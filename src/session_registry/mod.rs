//! SessionRegistry - active camera sessions
//!
//! Explicit `camera_id → session` map handed to whatever needs to enumerate
//! cameras (control API, shutdown). Removing a session stops it and its
//! media server.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::camera_session::CameraSession;
use crate::error::{Error, Result};

struct RegisteredSession {
    session: Arc<CameraSession>,
    media_server: Option<JoinHandle<()>>,
}

impl RegisteredSession {
    async fn shutdown(self) {
        if let Some(server) = self.media_server {
            server.abort();
        }
        self.session.stop().await;
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, RegisteredSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a started session and the task serving its media port
    pub async fn insert(
        &self,
        session: Arc<CameraSession>,
        media_server: Option<JoinHandle<()>>,
    ) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let camera_id = session.id().to_string();
        if sessions.contains_key(&camera_id) {
            if let Some(server) = media_server {
                server.abort();
            }
            return Err(Error::Validation(format!(
                "camera {} already has a session",
                camera_id
            )));
        }
        sessions.insert(
            camera_id.clone(),
            RegisteredSession {
                session,
                media_server,
            },
        );
        tracing::info!(camera_id = %camera_id, total = sessions.len(), "Session registered");
        Ok(())
    }

    /// Unregister and stop
    pub async fn remove(&self, camera_id: &str) -> Option<Arc<CameraSession>> {
        let entry = self.sessions.write().await.remove(camera_id)?;
        let session = entry.session.clone();
        entry.shutdown().await;
        tracing::info!(camera_id = %camera_id, "Session removed");
        Some(session)
    }

    pub async fn get(&self, camera_id: &str) -> Option<Arc<CameraSession>> {
        self.sessions
            .read()
            .await
            .get(camera_id)
            .map(|e| e.session.clone())
    }

    /// Sessions ordered by camera id
    pub async fn list(&self) -> Vec<Arc<CameraSession>> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<_> = sessions.values().map(|e| e.session.clone()).collect();
        list.sort_by(|a, b| a.id().cmp(b.id()));
        list
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Swap the media server task (port changed on reconfigure)
    pub async fn replace_media_server(
        &self,
        camera_id: &str,
        media_server: Option<JoinHandle<()>>,
    ) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(camera_id)
            .ok_or_else(|| Error::NotFound(format!("camera {}", camera_id)))?;
        if let Some(old) = std::mem::replace(&mut entry.media_server, media_server) {
            old.abort();
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        let drained: Vec<RegisteredSession> =
            self.sessions.write().await.drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            entry.shutdown().await;
        }
        tracing::info!(count, "All sessions stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera_session::{OfflineReason, SessionSettings, SessionStatus};
    use crate::config_store::CameraConfig;
    use crate::realtime_hub::RealtimeHub;
    use crate::vendor_adapter::CameraBrand;

    fn session(id: &str) -> Arc<CameraSession> {
        let mut config = CameraConfig::new(id, CameraBrand::Doorbird, "127.0.0.1");
        config.port = 9;
        CameraSession::new(config, SessionSettings::default(), Arc::new(RealtimeHub::new())).unwrap()
    }

    #[tokio::test]
    async fn test_insert_get_list() {
        let registry = SessionRegistry::new();
        registry.insert(session("b"), None).await.unwrap();
        registry.insert(session("a"), None).await.unwrap();

        assert_eq!(registry.len().await, 2);
        assert!(registry.get("a").await.is_some());
        assert!(registry.get("zzz").await.is_none());
        let ids: Vec<_> = registry.list().await.iter().map(|s| s.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_duplicate_rejected() {
        let registry = SessionRegistry::new();
        registry.insert(session("a"), None).await.unwrap();
        assert!(matches!(
            registry.insert(session("a"), None).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_stops_session() {
        let registry = SessionRegistry::new();
        let s = session("a");
        registry.insert(s.clone(), None).await.unwrap();

        let removed = registry.remove("a").await.unwrap();
        assert!(Arc::ptr_eq(&removed, &s));
        assert!(registry.is_empty().await);
        assert!(matches!(
            s.status(),
            SessionStatus::Offline { reason: OfflineReason::Gone, .. }
        ));
        assert!(registry.remove("a").await.is_none());
    }
}
