//! On-disk layout of a reconstruction and retried file writes
//!
//! ```text
//! <data_root>/<reconstruction_id>/
//!     images/0.jpg, 1.jpg, ...
//!     camera_settings.txt
//!     ply.ply, scene.mvs, ...   (written by the engine)
//! ```

use crate::error::{OrchestratorError, Result};
use crate::reconstruction::{CameraSettings, ReconstructionId};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const IMAGES_DIR: &str = "images";
pub const CAMERA_SETTINGS_FILE: &str = "camera_settings.txt";
pub const PLY_FILE: &str = "ply.ply";

/// Deterministic per-reconstruction paths under one data root
#[derive(Debug, Clone)]
pub struct ReconstructionLayout {
    root: PathBuf,
}

impl ReconstructionLayout {
    /// Anchor `root` to the current directory so paths stay valid when the
    /// engine runs from its own working directory
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()?.join(root)
        };
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn reconstruction_dir(&self, id: &ReconstructionId) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub fn images_dir(&self, id: &ReconstructionId) -> PathBuf {
        self.reconstruction_dir(id).join(IMAGES_DIR)
    }

    pub fn image_path(&self, id: &ReconstructionId, index: u32) -> PathBuf {
        self.images_dir(id).join(format!("{}.jpg", index))
    }

    pub fn camera_settings_path(&self, id: &ReconstructionId) -> PathBuf {
        self.reconstruction_dir(id).join(CAMERA_SETTINGS_FILE)
    }

    /// Directory the engine writes its artifacts into
    pub fn output_dir(&self, id: &ReconstructionId) -> PathBuf {
        self.reconstruction_dir(id)
    }

    pub fn ply_path(&self, id: &ReconstructionId) -> PathBuf {
        self.output_dir(id).join(PLY_FILE)
    }

    /// Path of an engine artifact, or `None` if `file_name` tries to leave the
    /// reconstruction directory
    pub fn artifact_path(&self, id: &ReconstructionId, file_name: &str) -> Option<PathBuf> {
        let candidate = Path::new(file_name);
        let is_plain = !file_name.is_empty()
            && candidate
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        is_plain.then(|| self.output_dir(id).join(candidate))
    }
}

/// Bounded retry with a fixed pause between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_ms", rename = "backoff_ms")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(250),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Writes uploaded images and camera records into the layout
#[derive(Debug, Clone)]
pub struct ImageStorage {
    layout: ReconstructionLayout,
    retry: RetryPolicy,
}

impl ImageStorage {
    pub fn new(layout: ReconstructionLayout, retry: RetryPolicy) -> Self {
        Self { layout, retry }
    }

    pub fn layout(&self) -> &ReconstructionLayout {
        &self.layout
    }

    /// Create the directory tree of a new reconstruction
    pub async fn prepare(&self, id: &ReconstructionId) -> Result<()> {
        tokio::fs::create_dir_all(self.layout.images_dir(id)).await?;
        Ok(())
    }

    /// Store the image with the given index (`{index}.jpg`)
    pub async fn save_image(&self, id: &ReconstructionId, index: u32, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.layout.image_path(id, index);
        self.write_with_retry(&path, bytes).await?;
        debug!("Stored image {} for {} ({} bytes)", index, id, bytes.len());
        Ok(path)
    }

    pub async fn write_camera_settings(
        &self,
        id: &ReconstructionId,
        settings: &CameraSettings,
    ) -> Result<PathBuf> {
        let path = self.layout.camera_settings_path(id);
        self.write_with_retry(&path, settings.to_engine_format().as_bytes())
            .await?;
        Ok(path)
    }

    /// Whether the engine has produced `file_name` for this reconstruction
    pub async fn file_available(&self, id: &ReconstructionId, file_name: &str) -> bool {
        match self.layout.artifact_path(id, file_name) {
            Some(path) => tokio::fs::metadata(path).await.is_ok(),
            None => false,
        }
    }

    async fn write_with_retry(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match tokio::fs::write(path, bytes).await {
                Ok(()) => return Ok(()),
                Err(source) if attempt >= max_attempts => {
                    return Err(OrchestratorError::TransientIo {
                        path: path.to_path_buf(),
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    warn!(
                        "Write to {} failed (attempt {}/{}): {}; retrying in {}ms",
                        path.display(),
                        attempt,
                        max_attempts,
                        e,
                        self.retry.backoff.as_millis()
                    );
                    tokio::time::sleep(self.retry.backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(root: &Path, max_attempts: u32) -> ImageStorage {
        ImageStorage::new(
            ReconstructionLayout::new(root).unwrap(),
            RetryPolicy {
                max_attempts,
                backoff: Duration::from_millis(20),
            },
        )
    }

    #[test]
    fn test_layout_paths() {
        let layout = ReconstructionLayout::new("/srv/data").unwrap();
        let id = ReconstructionId::from("abc");

        assert_eq!(layout.images_dir(&id), PathBuf::from("/srv/data/abc/images"));
        assert_eq!(layout.image_path(&id, 3), PathBuf::from("/srv/data/abc/images/3.jpg"));
        assert_eq!(
            layout.camera_settings_path(&id),
            PathBuf::from("/srv/data/abc/camera_settings.txt")
        );
        assert_eq!(layout.ply_path(&id), PathBuf::from("/srv/data/abc/ply.ply"));
    }

    #[test]
    fn test_relative_root_is_anchored() {
        let layout = ReconstructionLayout::new("data").unwrap();
        assert!(layout.root().is_absolute());
        assert!(layout.root().ends_with("data"));
    }

    #[test]
    fn test_artifact_path_rejects_traversal() {
        let layout = ReconstructionLayout::new("/srv/data").unwrap();
        let id = ReconstructionId::from("abc");

        assert!(layout.artifact_path(&id, "scene.mvs").is_some());
        assert!(layout.artifact_path(&id, "../other/scene.mvs").is_none());
        assert!(layout.artifact_path(&id, "/etc/passwd").is_none());
        assert!(layout.artifact_path(&id, "").is_none());
    }

    #[tokio::test]
    async fn test_save_image_and_camera_settings() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 3);
        let id = ReconstructionId::from("abc");

        storage.prepare(&id).await.unwrap();
        let image = storage.save_image(&id, 0, b"jpeg-bytes").await.unwrap();
        assert_eq!(std::fs::read(image).unwrap(), b"jpeg-bytes");

        let settings = CameraSettings::centered(100, 50, 6000.0);
        let path = storage.write_camera_settings(&id, &settings).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "100\n50\n6000\n50.0\n25.0\n1.0\n0.0\n\n"
        );
    }

    #[tokio::test]
    async fn test_write_escalates_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 3);
        let id = ReconstructionId::from("never-prepared");

        let err = storage.save_image(&id, 1, b"bytes").await.unwrap_err();
        match err {
            OrchestratorError::TransientIo { attempts, path, .. } => {
                assert_eq!(attempts, 3);
                assert!(path.ends_with("never-prepared/images/1.jpg"));
            }
            other => panic!("Expected TransientIo, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_succeeds_once_storage_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 50);
        let id = ReconstructionId::from("late");

        // Directory shows up while the writer is backing off
        let images_dir = storage.layout().images_dir(&id);
        let creator = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            tokio::fs::create_dir_all(images_dir).await.unwrap();
        });

        let path = storage.save_image(&id, 0, b"bytes").await.unwrap();
        creator.await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_file_available() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 1);
        let id = ReconstructionId::from("abc");
        storage.prepare(&id).await.unwrap();

        assert!(!storage.file_available(&id, PLY_FILE).await);
        std::fs::write(storage.layout().ply_path(&id), b"ply").unwrap();
        assert!(storage.file_available(&id, PLY_FILE).await);
        assert!(!storage.file_available(&id, "../abc/ply.ply").await);
    }
}
