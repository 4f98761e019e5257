//! Detector pool: batched multi-model detection.
//!
//! Three channels per batch: person + segmentation, face, plate/vehicle.
//! The backends share one small object-safe interface; the pool probes the
//! accelerator once at init, picks a strategy (model tier, batch size,
//! sequential vs parallel execution) and owns the sessions until `close`
//! releases them.

mod yolo;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use oshield_models::{BoundingBox, DetectionType};

use crate::error::{MediaError, MediaResult};
use crate::gpu::{probe_accelerator_memory_mb, DetectorStrategy, StrategyMode};
use crate::reader::Frame;

pub use yolo::{BoxDetector, BoxKind, SegDetector};

/// Detections per frame index, in frame order for the tracker.
pub type FrameDetections = HashMap<u64, Vec<(DetectionType, BoundingBox)>>;

/// Minimal interface shared by the detection backends.
pub trait DetectorBackend: Send + Sync {
    /// Run one batched inference over decoded frames.
    fn detect_batch(&self, frames: &[Frame]) -> MediaResult<FrameDetections>;

    /// Human-readable channel label.
    fn name(&self) -> &'static str;
}

/// Detector pool configuration.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Directory holding the ONNX weight files
    pub models_dir: PathBuf,
    /// Explicit person+segmentation model path (else tier default)
    pub person_model: Option<PathBuf>,
    /// Explicit plate model path (else tier default; a generic model acts
    /// as a vehicle proxy)
    pub plate_model: Option<PathBuf>,
    /// Explicit face model path (else tier default)
    pub face_model: Option<PathBuf>,
    pub face_confidence: f32,
    pub person_confidence: f32,
    pub nms_threshold: f32,
    /// Square model input size
    pub input_size: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            person_model: None,
            plate_model: None,
            face_model: None,
            face_confidence: 0.5,
            person_confidence: 0.5,
            nms_threshold: 0.45,
            input_size: 640,
        }
    }
}

/// Batched multi-model detector pool.
pub struct DetectorPool {
    strategy: DetectorStrategy,
    person: Option<Arc<dyn DetectorBackend>>,
    face: Option<Arc<dyn DetectorBackend>>,
    plate: Option<Arc<dyn DetectorBackend>>,
    config: DetectorConfig,
}

impl DetectorPool {
    /// Probe the accelerator, select a strategy and load whatever models are
    /// present. Missing models disable their channel with a warning; face
    /// detection additionally falls back to the Haar cascade when the
    /// `opencv` feature is enabled.
    pub async fn init(config: DetectorConfig) -> MediaResult<Self> {
        let memory = probe_accelerator_memory_mb().await;
        let strategy = DetectorStrategy::select(memory);
        let suffix = strategy.model_size.suffix();

        let person_path = config
            .person_model
            .clone()
            .unwrap_or_else(|| config.models_dir.join(format!("yolo11{suffix}-seg.onnx")));
        let face_path = config
            .face_model
            .clone()
            .unwrap_or_else(|| config.models_dir.join(format!("yolov8{suffix}-face.onnx")));
        let specialized_plate = config
            .plate_model
            .clone()
            .unwrap_or_else(|| config.models_dir.join(format!("license_plate_{suffix}.onnx")));
        let proxy_plate = config.models_dir.join(format!("yolov8{suffix}.onnx"));

        let person = load_optional(&person_path, "person+segmentation", |p| {
            SegDetector::load(p, config.person_confidence, config.nms_threshold, config.input_size)
        });

        let face = load_optional(&face_path, "face", |p| {
            BoxDetector::load(
                p,
                BoxKind::Face,
                config.face_confidence,
                config.nms_threshold,
                config.input_size,
            )
        });

        let plate = if specialized_plate.exists() {
            load_optional(&specialized_plate, "license plate", |p| {
                BoxDetector::load(
                    p,
                    BoxKind::PlateSpecialized,
                    config.person_confidence,
                    config.nms_threshold,
                    config.input_size,
                )
            })
        } else {
            load_optional(&proxy_plate, "vehicle (plate proxy)", |p| {
                BoxDetector::load(
                    p,
                    BoxKind::VehicleProxy,
                    config.person_confidence,
                    config.nms_threshold,
                    config.input_size,
                )
            })
        };

        let pool = Self {
            strategy,
            person,
            face,
            plate,
            config,
        };
        info!(
            strategy = ?pool.strategy.mode,
            model_size = pool.strategy.model_size.as_str(),
            batch = pool.strategy.batch_size,
            detectors = %pool.info(),
            "Detector pool initialized"
        );
        Ok(pool)
    }

    /// Batch size selected by the strategy.
    pub fn batch_size(&self) -> usize {
        self.strategy.batch_size
    }

    /// Pool configuration.
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Human-readable list of active detectors.
    pub fn info(&self) -> String {
        let mut parts: Vec<&'static str> = [&self.person, &self.face, &self.plate]
            .iter()
            .filter_map(|channel| channel.as_ref().map(|backend| backend.name()))
            .collect();
        if self.face.is_none() && cfg!(feature = "opencv") {
            parts.push("face (Haar cascade)");
        }
        parts.join(", ")
    }

    /// Run every channel over one frame batch and merge per-frame results.
    ///
    /// Outputs are deterministic for a fixed (model, weights, input) tuple,
    /// and frames are never reordered.
    pub async fn detect_all(&self, frames: Arc<Vec<Frame>>) -> MediaResult<FrameDetections> {
        let mut merged: FrameDetections = frames.iter().map(|f| (f.index, Vec::new())).collect();
        if frames.is_empty() {
            return Ok(merged);
        }

        let outputs = match self.strategy.mode {
            StrategyMode::Sequential => {
                let mut outputs = Vec::with_capacity(3);
                for channel in [self.person.clone(), self.face.clone(), self.plate.clone()] {
                    outputs.push(run_channel(channel, Arc::clone(&frames)).await?);
                }
                outputs
            }
            StrategyMode::Parallel => {
                let (person, face, plate) = tokio::join!(
                    run_channel(self.person.clone(), Arc::clone(&frames)),
                    run_channel(self.face.clone(), Arc::clone(&frames)),
                    run_channel(self.plate.clone(), Arc::clone(&frames)),
                );
                vec![person?, face?, plate?]
            }
        };

        for channel in outputs.into_iter().flatten() {
            for (frame_index, mut detections) in channel {
                merged.entry(frame_index).or_default().append(&mut detections);
            }
        }

        #[cfg(feature = "opencv")]
        if self.face.is_none() {
            for frame in frames.iter() {
                let faces = yolo::detect_faces_cascade(frame, self.config.face_confidence)?;
                merged.entry(frame.index).or_default().extend(faces);
            }
        }

        let total: usize = merged.values().map(Vec::len).sum();
        metrics::counter!("oshield_detections_total").increment(total as u64);
        Ok(merged)
    }

    /// Drop every model session, releasing accelerator memory.
    pub fn close(&mut self) {
        self.person = None;
        self.face = None;
        self.plate = None;
        info!("Detector pool closed, model sessions released");
    }
}

/// Run one backend on the blocking pool; `None` channels resolve to `None`.
async fn run_channel(
    backend: Option<Arc<dyn DetectorBackend>>,
    frames: Arc<Vec<Frame>>,
) -> MediaResult<Option<FrameDetections>> {
    let Some(backend) = backend else {
        return Ok(None);
    };
    tokio::task::spawn_blocking(move || backend.detect_batch(&frames).map(Some))
        .await
        .map_err(|e| MediaError::internal(e.to_string()))?
}

fn load_optional<T: DetectorBackend + 'static>(
    path: &Path,
    channel: &str,
    loader: impl FnOnce(&Path) -> MediaResult<T>,
) -> Option<Arc<dyn DetectorBackend>> {
    if !path.exists() {
        warn!(path = %path.display(), "No {channel} model; channel disabled");
        return None;
    }
    match loader(path) {
        Ok(detector) => Some(Arc::new(detector)),
        Err(e) => {
            warn!(path = %path.display(), "Failed to load {channel} model: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_without_models_runs_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = DetectorConfig {
            models_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let pool = DetectorPool::init(config).await.unwrap();

        let frames = Arc::new(vec![Frame {
            index: 1,
            width: 64,
            height: 64,
            data: vec![0; Frame::byte_len(64, 64)],
        }]);
        let detections = pool.detect_all(frames).await.unwrap();
        assert_eq!(detections.len(), 1);
        assert!(detections[&1].is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = DetectorConfig {
            models_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let pool = DetectorPool::init(config).await.unwrap();
        let detections = pool.detect_all(Arc::new(Vec::new())).await.unwrap();
        assert!(detections.is_empty());
    }
}
