//! ConfigStore Repository
//!
//! File access layer for the cameras file

use std::path::{Path, PathBuf};

use super::types::*;
use crate::error::{Error, Result};

/// JSON cameras file
#[derive(Debug, Clone)]
pub struct ConfigRepository {
    path: PathBuf,
}

impl ConfigRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and validate every camera. A missing file is an empty inventory.
    pub async fn load(&self) -> Result<Vec<CameraConfig>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %self.path.display(), "Cameras file not found, starting empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let file: CamerasFile = serde_json::from_str(&raw).map_err(|e| {
            Error::Config(format!("{}: {}", self.path.display(), e))
        })?;
        file.validate()?;

        Ok(file.cameras)
    }

    /// Write the full inventory, replacing the file atomically
    pub async fn save(&self, cameras: &[CameraConfig]) -> Result<()> {
        let file = CamerasFile {
            cameras: cameras.to_vec(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vendor_adapter::CameraBrand;

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ConfigRepository::new(dir.path().join("cameras.json"));
        assert!(repo.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ConfigRepository::new(dir.path().join("cameras.json"));

        let mut camera = CameraConfig::new("gate", CameraBrand::Doorbird, "10.0.0.9");
        camera.username = "ghxyz".to_string();
        repo.save(&[camera.clone()]).await.unwrap();

        assert_eq!(repo.load().await.unwrap(), vec![camera]);
    }

    #[tokio::test]
    async fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cameras.json");
        std::fs::write(&path, "{\"cameras\": [ {\"camera_id\": 1} ]}").unwrap();

        let err = ConfigRepository::new(path).load().await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
