//! Filesystem layout for uploads, captures and processed outputs.

use std::path::{Path, PathBuf};

use crate::error::{PipelineError, PipelineResult};

/// Storage layout rooted at one directory:
///
/// ```text
/// storage/uploads/<video_id>.<ext>
/// storage/captures/<video_id>/track_<tid>/capture_<frame>.jpg
/// storage/processed/anonymized_<basename>.mp4
/// ```
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join("uploads")
    }

    pub fn captures_dir(&self, video_id: &str) -> PathBuf {
        self.root.join("captures").join(video_id)
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.root.join("processed")
    }

    /// Output path for a source file: `processed/anonymized_<basename>.mp4`.
    pub fn processed_path(&self, input_path: &str) -> PathBuf {
        let stem = Path::new(input_path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());
        self.processed_dir().join(format!("anonymized_{stem}.mp4"))
    }

    /// Create the directory tree.
    pub fn ensure_dirs(&self) -> PipelineResult<()> {
        for dir in [
            self.uploads_dir(),
            self.root.join("captures"),
            self.processed_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                PipelineError::Resource(format!("cannot create {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }

    /// Remove every capture of one video (phase-1 failure cleanup).
    pub async fn clean_captures(&self, video_id: &str) {
        let dir = self.captures_dir(video_id);
        if dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                tracing::warn!(dir = %dir.display(), "Failed to clean captures: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processed_path_uses_basename() {
        let layout = StorageLayout::new("storage");
        let path = layout.processed_path("storage/uploads/vid_abc.webm");
        assert_eq!(
            path,
            PathBuf::from("storage/processed/anonymized_vid_abc.mp4")
        );
    }

    #[test]
    fn test_captures_dir_per_video() {
        let layout = StorageLayout::new("storage");
        assert_eq!(
            layout.captures_dir("vid_x"),
            PathBuf::from("storage/captures/vid_x")
        );
    }

    #[tokio::test]
    async fn test_ensure_and_clean() {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path());
        layout.ensure_dirs().unwrap();
        assert!(layout.uploads_dir().exists());

        let captures = layout.captures_dir("vid_x");
        std::fs::create_dir_all(captures.join("track_1")).unwrap();
        layout.clean_captures("vid_x").await;
        assert!(!captures.exists());
    }
}
