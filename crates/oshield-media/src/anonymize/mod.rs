//! Anonymization pass: per-track, per-frame effect application.
//!
//! Second pass over the source video. Each action carries the frame→bbox map
//! reconstructed from a persisted detection record; short gaps are filled by
//! linear interpolation before the pass so an effect does not flicker while
//! a tracker briefly lost its object.

pub mod effects;

use std::collections::HashMap;
use std::path::Path;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{MediaError, MediaResult};
use crate::finalize::{finalize_metadata, FinalizeMetadata};
use crate::probe::{probe_video, validate_video};
use crate::reader::{FrameReader, FrameWriter};

pub use effects::{clip_rect, Roi};

/// Maximum gap (frames) bridged by interpolation; anything longer is a
/// legitimate track disappearance.
const MAX_INTERPOLATION_GAP: u64 = 10;

/// Minimum bbox-to-frame area ratio for polygon-masked effects.
const MIN_MASKED_AREA_RATIO: f64 = 0.001;

/// Effect applied to one track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectKind {
    Blur,
    Pixelate,
    Mask,
}

/// Per-effect tunables.
#[derive(Debug, Clone)]
pub struct EffectConfig {
    /// Gaussian kernel size; forced odd downstream
    pub kernel_size: u32,
    /// Gaussian sigma; 0 derives from the kernel size
    pub sigma: f64,
    /// Mosaic grid side for pixelation
    pub blocks: u32,
    /// PRNG key for the scramble permutation
    pub scramble_seed: u64,
}

impl Default for EffectConfig {
    fn default() -> Self {
        Self {
            kernel_size: 31,
            sigma: 0.0,
            blocks: 10,
            scramble_seed: 42,
        }
    }
}

/// One anonymization action: an effect over a track's frame geometry.
#[derive(Debug, Clone)]
pub struct AnonymizeAction {
    pub kind: EffectKind,
    pub track_id: u64,
    /// frame → `[x1, y1, x2, y2]`
    pub bboxes: HashMap<u64, [f64; 4]>,
    /// frame → flattened polygon, where segmentation produced one
    pub masks: HashMap<u64, Vec<f64>>,
    pub config: EffectConfig,
}

impl AnonymizeAction {
    /// Fill gaps of `1 < gap ≤ 10` frames with linearly interpolated boxes.
    pub fn interpolate_gaps(&mut self) {
        let mut frames: Vec<u64> = self.bboxes.keys().copied().collect();
        frames.sort_unstable();

        let mut filled = 0u64;
        for window in frames.windows(2) {
            let (f1, f2) = (window[0], window[1]);
            let gap = f2 - f1;
            if gap <= 1 || gap > MAX_INTERPOLATION_GAP {
                continue;
            }
            let a = self.bboxes[&f1];
            let b = self.bboxes[&f2];
            for step in 1..gap {
                let t = step as f64 / gap as f64;
                let frame = f1 + step;
                self.bboxes.insert(
                    frame,
                    [
                        a[0] + (b[0] - a[0]) * t,
                        a[1] + (b[1] - a[1]) * t,
                        a[2] + (b[2] - a[2]) * t,
                        a[3] + (b[3] - a[3]) * t,
                    ],
                );
                filled += 1;
            }
        }
        if filled > 0 {
            debug!(track_id = self.track_id, filled, "Interpolated track gaps");
        }
    }
}

/// Applies effects over the source video and finalizes the output.
pub struct Anonymizer;

impl Default for Anonymizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Anonymizer {
    pub fn new() -> Self {
        Self
    }

    /// Run the full anonymization pass.
    ///
    /// Deterministic given the same inputs: seeded noise and permutations
    /// mean applying the same decision batch twice produces the same video.
    /// `progress` receives `(current_frame, total_frames)` updates.
    pub async fn apply(
        &self,
        video_id: &str,
        input_path: &str,
        output_path: &str,
        mut actions: Vec<AnonymizeAction>,
        user_display_name: &str,
        cancel: &watch::Receiver<bool>,
        progress: Option<mpsc::Sender<(u64, u64)>>,
    ) -> MediaResult<()> {
        let info = probe_video(input_path).await?;
        validate_video(&info)?;

        for action in &mut actions {
            action.interpolate_gaps();
        }

        info!(
            video_id = %video_id,
            actions = actions.len(),
            frames = info.total_frames,
            "Starting anonymization pass"
        );

        let working_path = format!("{output_path}.encoding.mp4");
        let mut reader = FrameReader::open(input_path, &info).await?;
        let mut writer =
            FrameWriter::create(&working_path, info.width, info.height, info.fps).await?;

        let frame_area = (info.width as f64) * (info.height as f64);
        let mut processed = 0u64;

        loop {
            let Some(mut frame) = reader.next_frame().await? else {
                break;
            };

            for action in &actions {
                let Some(bbox) = action.bboxes.get(&frame.index) else {
                    continue;
                };
                let polygon = action.masks.get(&frame.index);

                if polygon.is_some() {
                    let area = (bbox[2] - bbox[0]).max(0.0) * (bbox[3] - bbox[1]).max(0.0);
                    if area / frame_area < MIN_MASKED_AREA_RATIO {
                        continue;
                    }
                }

                let Some(roi) = clip_rect(frame.width, frame.height, bbox) else {
                    continue;
                };
                let mask = polygon
                    .filter(|_| action.kind != EffectKind::Mask)
                    .map(|p| effects::rasterize_polygon(p, &roi));

                match action.kind {
                    EffectKind::Blur => effects::gaussian_blur_region(
                        &mut frame.data,
                        frame.width,
                        &roi,
                        action.config.kernel_size,
                        action.config.sigma,
                        mask.as_deref(),
                    ),
                    EffectKind::Pixelate => effects::pixelate_region(
                        &mut frame.data,
                        frame.width,
                        &roi,
                        action.config.blocks,
                        action.track_id,
                        mask.as_deref(),
                    ),
                    EffectKind::Mask => effects::scramble_region(
                        &mut frame.data,
                        frame.width,
                        &roi,
                        action.config.scramble_seed,
                    ),
                }
            }

            writer.write_frame(&frame.data).await?;
            processed += 1;

            if processed % 30 == 0 {
                if let Some(progress) = &progress {
                    let _ = progress.try_send((processed, info.total_frames));
                }
            }

            // Cancellation: finalize the current frame, then stop.
            if *cancel.borrow() {
                warn!(video_id = %video_id, frame = processed, "Anonymization cancelled");
                reader.close().await;
                writer.abort().await;
                let _ = tokio::fs::remove_file(&working_path).await;
                return Err(MediaError::Cancelled);
            }
        }

        reader.close().await;
        writer.finish().await?;

        let metadata = FinalizeMetadata::for_processing(video_id, user_display_name);
        if let Err(e) = finalize_metadata(&working_path, output_path, &metadata).await {
            // A missing remuxer degrades to the unstripped encode.
            warn!("Metadata finalize unavailable, keeping encoded file: {e}");
            tokio::fs::rename(&working_path, output_path).await?;
        } else {
            let _ = tokio::fs::remove_file(&working_path).await;
        }

        if !Path::new(output_path).exists() {
            return Err(MediaError::internal(format!(
                "anonymization produced no output at {output_path}"
            )));
        }

        info!(video_id = %video_id, frames = processed, output = %output_path, "Anonymization complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action_with_frames(frames: &[u64]) -> AnonymizeAction {
        let mut bboxes = HashMap::new();
        for &f in frames {
            bboxes.insert(f, [10.0, 10.0, 50.0, 50.0]);
        }
        AnonymizeAction {
            kind: EffectKind::Blur,
            track_id: 1,
            bboxes,
            masks: HashMap::new(),
            config: EffectConfig::default(),
        }
    }

    #[test]
    fn test_gap_of_ten_is_filled() {
        let mut action = action_with_frames(&[10, 20]);
        action.interpolate_gaps();
        // Frames 11..=19 filled.
        assert_eq!(action.bboxes.len(), 11);
        assert!(action.bboxes.contains_key(&15));
    }

    #[test]
    fn test_gap_of_eleven_is_not_filled() {
        let mut action = action_with_frames(&[10, 21]);
        action.interpolate_gaps();
        assert_eq!(action.bboxes.len(), 2);
    }

    #[test]
    fn test_interpolation_is_linear() {
        let mut action = action_with_frames(&[]);
        action.bboxes.insert(10, [0.0, 0.0, 10.0, 10.0]);
        action.bboxes.insert(20, [100.0, 50.0, 110.0, 60.0]);
        action.interpolate_gaps();

        let mid = action.bboxes[&15];
        assert!((mid[0] - 50.0).abs() < 1e-9);
        assert!((mid[1] - 25.0).abs() < 1e-9);
        assert!((mid[2] - 60.0).abs() < 1e-9);
        assert!((mid[3] - 35.0).abs() < 1e-9);
    }

    #[test]
    fn test_adjacent_frames_need_no_interpolation() {
        let mut action = action_with_frames(&[5, 6, 7]);
        action.interpolate_gaps();
        assert_eq!(action.bboxes.len(), 3);
    }

    #[test]
    fn test_effect_config_defaults() {
        let config = EffectConfig::default();
        assert_eq!(config.kernel_size, 31);
        assert_eq!(config.blocks, 10);
        assert_eq!(config.scramble_seed, 42);
    }
}
