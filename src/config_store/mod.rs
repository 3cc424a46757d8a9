//! ConfigStore - camera inventory
//!
//! ## Responsibilities
//!
//! - Load per-camera configuration from the cameras file
//! - Validate entries (ids, addresses, duplicates)
//! - Persist reconfiguration made through the control API
//!
//! All camera configuration reads/writes go through here; sessions get a
//! copy at start and on reconfigure.

mod repository;
mod types;

pub use repository::ConfigRepository;
pub use types::*;

use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// ConfigStore instance
pub struct ConfigStore {
    repo: ConfigRepository,
    /// In-memory copy, file order preserved
    cameras: RwLock<Vec<CameraConfig>>,
}

impl ConfigStore {
    /// Load the cameras file
    pub async fn load(repo: ConfigRepository) -> Result<Self> {
        let cameras = repo.load().await?;
        tracing::info!(
            path = %repo.path().display(),
            cameras = cameras.len(),
            "ConfigStore loaded"
        );
        Ok(Self {
            repo,
            cameras: RwLock::new(cameras),
        })
    }

    pub async fn list_cameras(&self) -> Vec<CameraConfig> {
        self.cameras.read().await.clone()
    }

    pub async fn get_camera(&self, camera_id: &str) -> Option<CameraConfig> {
        self.cameras
            .read()
            .await
            .iter()
            .find(|c| c.camera_id == camera_id)
            .cloned()
    }

    /// Replace an existing camera's configuration and persist it
    pub async fn update_camera(&self, config: CameraConfig) -> Result<CameraConfig> {
        config.validate()?;

        let mut cameras = self.cameras.write().await;
        let slot = cameras
            .iter_mut()
            .find(|c| c.camera_id == config.camera_id)
            .ok_or_else(|| Error::NotFound(format!("Camera {} not found", config.camera_id)))?;
        *slot = config.clone();

        self.repo.save(&cameras).await?;
        tracing::info!(camera_id = %config.camera_id, "Camera configuration updated");

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vendor_adapter::CameraBrand;

    #[tokio::test]
    async fn test_update_persists() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ConfigRepository::new(dir.path().join("cameras.json"));
        repo.save(&[CameraConfig::new("porch", CameraBrand::Instar, "10.0.0.5")])
            .await
            .unwrap();

        let store = ConfigStore::load(repo.clone()).await.unwrap();
        let mut updated = store.get_camera("porch").await.unwrap();
        updated.poll_interval_ms = 750;
        store.update_camera(updated).await.unwrap();

        let reloaded = ConfigStore::load(repo).await.unwrap();
        assert_eq!(reloaded.get_camera("porch").await.unwrap().poll_interval_ms, 750);
    }

    #[tokio::test]
    async fn test_update_unknown_camera() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(ConfigRepository::new(dir.path().join("c.json")))
            .await
            .unwrap();
        let err = store
            .update_camera(CameraConfig::new("ghost", CameraBrand::Onvif, "10.0.0.1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
