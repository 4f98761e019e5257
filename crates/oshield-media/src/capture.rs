//! Capture manager: decides which frames to snapshot per track and writes
//! the clean + annotated evidence crops.

use std::collections::HashMap;
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, ImageBuffer, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use rusttype::{Font, Scale};
use tracing::{debug, warn};

use oshield_models::{BoundingBox, DetectionType};

use crate::error::MediaResult;
use crate::reader::Frame;

/// Font locations tried for the annotation label.
const FONT_CANDIDATES: [&str; 3] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/System/Library/Fonts/Helvetica.ttc",
];

/// Capture policy tunables.
#[derive(Debug, Clone)]
pub struct CapturePolicy {
    /// Confidence at or above which a frame counts as stable
    pub stability_threshold: f64,
    /// Consecutive stable frames required before the first capture
    pub stability_frames: u32,
    /// Minimum seconds between captures of the same track
    pub capture_interval: f64,
    /// Margin in pixels around the box, clipped to the frame
    pub crop_margin: u32,
    /// JPEG quality for both crops
    pub jpeg_quality: u8,
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self {
            stability_threshold: 0.5,
            stability_frames: 3,
            capture_interval: 1.0,
            crop_margin: 20,
            jpeg_quality: 95,
        }
    }
}

/// Capture quota for a track of the given duration in seconds.
pub fn capture_quota(duration_seconds: f64) -> u32 {
    if duration_seconds < 2.0 {
        1
    } else if duration_seconds < 4.0 {
        2
    } else if duration_seconds < 6.0 {
        3
    } else {
        6.min((duration_seconds / 2.0) as u32)
    }
}

#[derive(Debug)]
struct TrackCaptureState {
    stable_count: u32,
    last_capture_time: f64,
    captures_taken: u32,
    first_frame: u64,
}

/// Per-video capture manager. Owns the per-track stability counters and the
/// captures directory layout `<output_dir>/track_<tid>/capture_<frame>.jpg`.
pub struct CaptureManager {
    policy: CapturePolicy,
    output_dir: PathBuf,
    state: HashMap<u64, TrackCaptureState>,
    font: Option<Font<'static>>,
}

impl CaptureManager {
    /// Create a manager writing under `output_dir` (`captures/<video_id>`).
    pub fn new(output_dir: impl AsRef<Path>, policy: CapturePolicy) -> Self {
        let font = load_label_font();
        if font.is_none() {
            warn!("No label font found; annotated crops will carry box only");
        }
        Self {
            policy,
            output_dir: output_dir.as_ref().to_path_buf(),
            state: HashMap::new(),
            font,
        }
    }

    /// Evaluate one reported track state; write crops when the stability,
    /// spacing and quota gates all pass. Returns `(clean_path, annotated_path)`
    /// when a capture was taken.
    pub fn consider_frame(
        &mut self,
        track_id: u64,
        detection_type: DetectionType,
        frame: &Frame,
        bbox: &BoundingBox,
        fps: f64,
    ) -> MediaResult<Option<(String, String)>> {
        let entry = self
            .state
            .entry(track_id)
            .or_insert_with(|| TrackCaptureState {
                stable_count: 0,
                last_capture_time: f64::NEG_INFINITY,
                captures_taken: 0,
                first_frame: frame.index,
            });

        if bbox.confidence >= self.policy.stability_threshold {
            entry.stable_count += 1;
        } else {
            entry.stable_count = 0;
        }
        if entry.stable_count < self.policy.stability_frames {
            return Ok(None);
        }

        let timestamp = frame.index as f64 / fps;
        if timestamp - entry.last_capture_time < self.policy.capture_interval {
            return Ok(None);
        }

        let duration = (frame.index.saturating_sub(entry.first_frame)) as f64 / fps;
        if entry.captures_taken >= capture_quota(duration) {
            return Ok(None);
        }

        match self.save_capture(track_id, detection_type, frame, bbox)? {
            Some(paths) => {
                if let Some(entry) = self.state.get_mut(&track_id) {
                    entry.last_capture_time = timestamp;
                    entry.captures_taken += 1;
                }
                Ok(Some(paths))
            }
            None => Ok(None),
        }
    }

    /// Write the clean and annotated crops. An empty crop after clipping is
    /// skipped silently.
    fn save_capture(
        &self,
        track_id: u64,
        detection_type: DetectionType,
        frame: &Frame,
        bbox: &BoundingBox,
    ) -> MediaResult<Option<(String, String)>> {
        let margin = self.policy.crop_margin as i64;
        let x1 = ((bbox.x1 as i64) - margin).max(0) as u32;
        let y1 = ((bbox.y1 as i64) - margin).max(0) as u32;
        let x2 = ((bbox.x2 as i64) + margin).min(frame.width as i64) as u32;
        let y2 = ((bbox.y2 as i64) + margin).min(frame.height as i64) as u32;

        if x2 <= x1 || y2 <= y1 {
            debug!(track_id, "Empty crop after clipping, skipping capture");
            return Ok(None);
        }

        let crop = crop_rgb(frame, x1, y1, x2 - x1, y2 - y1);

        let track_dir = self.output_dir.join(format!("track_{track_id}"));
        fs::create_dir_all(&track_dir)?;

        let clean_path = track_dir.join(format!("capture_{}.jpg", frame.index));
        write_jpeg(&clean_path, &crop, self.policy.jpeg_quality)?;

        // Annotated copy: box + label drawn in crop coordinates.
        let mut annotated = crop;
        let color = type_color(detection_type);
        let rect_x = (bbox.x1 as i64 - x1 as i64).max(0) as i32;
        let rect_y = (bbox.y1 as i64 - y1 as i64).max(0) as i32;
        let rect_w = (bbox.width() as u32).max(1).min(annotated.width());
        let rect_h = (bbox.height() as u32).max(1).min(annotated.height());
        draw_hollow_rect_mut(
            &mut annotated,
            Rect::at(rect_x, rect_y).of_size(rect_w, rect_h),
            color,
        );
        if let Some(font) = &self.font {
            let label = format!("{} {:.0}%", detection_type, bbox.confidence * 100.0);
            draw_text_mut(
                &mut annotated,
                color,
                rect_x + 2,
                (rect_y - 16).max(0),
                Scale::uniform(14.0),
                font,
                &label,
            );
        }

        let annotated_path = track_dir.join(format!("capture_{}_bbox.jpg", frame.index));
        write_jpeg(&annotated_path, &annotated, self.policy.jpeg_quality)?;

        metrics::counter!("oshield_captures_total").increment(1);
        Ok(Some((
            clean_path.to_string_lossy().into_owned(),
            annotated_path.to_string_lossy().into_owned(),
        )))
    }
}

fn crop_rgb(frame: &Frame, x: u32, y: u32, w: u32, h: u32) -> RgbImage {
    let row_len = w as usize * 3;
    let stride = frame.width as usize * 3;
    let mut data = vec![0u8; h as usize * row_len];
    for row in 0..h as usize {
        let src_start = (y as usize + row) * stride + x as usize * 3;
        data[row * row_len..(row + 1) * row_len]
            .copy_from_slice(&frame.data[src_start..src_start + row_len]);
    }
    ImageBuffer::from_raw(w, h, data).expect("crop buffer dimensions match data length")
}

fn write_jpeg(path: &Path, image: &RgbImage, quality: u8) -> MediaResult<()> {
    let file = fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    let mut encoder = JpegEncoder::new_with_quality(&mut writer, quality);
    encoder
        .encode(image.as_raw(), image.width(), image.height(), ColorType::Rgb8)
        .map_err(|e| crate::error::MediaError::internal(format!("JPEG encode failed: {e}")))?;
    Ok(())
}

fn type_color(detection_type: DetectionType) -> Rgb<u8> {
    match detection_type {
        DetectionType::Face => Rgb([220, 40, 40]),
        DetectionType::Person => Rgb([40, 200, 80]),
        DetectionType::LicensePlate => Rgb([50, 90, 230]),
        _ => Rgb([230, 200, 40]),
    }
}

fn load_label_font() -> Option<Font<'static>> {
    for candidate in FONT_CANDIDATES {
        if let Ok(bytes) = fs::read(candidate) {
            if let Some(font) = Font::try_from_vec(bytes) {
                return Some(font);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn frame(index: u64, width: u32, height: u32) -> Frame {
        Frame {
            index,
            width,
            height,
            data: vec![128; Frame::byte_len(width, height)],
        }
    }

    fn bbox(x1: f64, y1: f64, x2: f64, y2: f64, conf: f64, frame: u64) -> BoundingBox {
        BoundingBox::new(x1, y1, x2, y2, conf, frame)
    }

    #[test]
    fn test_capture_quota_boundaries() {
        assert_eq!(capture_quota(1.99), 1);
        assert_eq!(capture_quota(2.0), 2);
        assert_eq!(capture_quota(4.0), 3);
        assert_eq!(capture_quota(5.99), 3);
        assert_eq!(capture_quota(6.0), 3);
        assert_eq!(capture_quota(8.0), 4);
        assert_eq!(capture_quota(12.0), 6);
        assert_eq!(capture_quota(40.0), 6);
    }

    #[test]
    fn test_stability_gate_requires_consecutive_frames() {
        let dir = TempDir::new().unwrap();
        let mut manager = CaptureManager::new(dir.path(), CapturePolicy::default());

        // Two stable frames, then a dip, then two more: no capture yet.
        for (i, conf) in [(1u64, 0.9), (2, 0.9), (3, 0.2), (4, 0.9), (5, 0.9)] {
            let result = manager
                .consider_frame(
                    1,
                    DetectionType::Face,
                    &frame(i, 320, 240),
                    &bbox(50.0, 50.0, 120.0, 130.0, conf, i),
                    30.0,
                )
                .unwrap();
            assert!(result.is_none(), "frame {i} should not capture");
        }

        // Third consecutive stable frame passes the gate.
        let result = manager
            .consider_frame(
                1,
                DetectionType::Face,
                &frame(6, 320, 240),
                &bbox(50.0, 50.0, 120.0, 130.0, 0.9, 6),
                30.0,
            )
            .unwrap();
        assert!(result.is_some());
    }

    #[test]
    fn test_temporal_spacing_between_captures() {
        let dir = TempDir::new().unwrap();
        let mut manager = CaptureManager::new(dir.path(), CapturePolicy::default());

        let mut captures = 0;
        // 120 frames at 30 fps = 4 s of track: interval allows one capture
        // per second, quota allows up to 2 before 4 s.
        for i in 1..=120u64 {
            let result = manager
                .consider_frame(
                    1,
                    DetectionType::Face,
                    &frame(i, 320, 240),
                    &bbox(50.0, 50.0, 120.0, 130.0, 0.9, i),
                    30.0,
                )
                .unwrap();
            if result.is_some() {
                captures += 1;
            }
        }
        assert_eq!(captures, 2);
    }

    #[test]
    fn test_capture_writes_both_files() {
        let dir = TempDir::new().unwrap();
        let policy = CapturePolicy {
            stability_frames: 1,
            ..Default::default()
        };
        let mut manager = CaptureManager::new(dir.path(), policy);

        let result = manager
            .consider_frame(
                7,
                DetectionType::Face,
                &frame(10, 320, 240),
                &bbox(50.0, 50.0, 120.0, 130.0, 0.9, 10),
                30.0,
            )
            .unwrap()
            .expect("capture expected");

        assert!(result.0.ends_with("track_7/capture_10.jpg") || result.0.contains("track_7"));
        assert!(std::path::Path::new(&result.0).exists());
        assert!(std::path::Path::new(&result.1).exists());
        assert!(result.1.contains("_bbox"));
    }

    #[test]
    fn test_empty_crop_skipped_silently() {
        let dir = TempDir::new().unwrap();
        let policy = CapturePolicy {
            stability_frames: 1,
            crop_margin: 0,
            ..Default::default()
        };
        let mut manager = CaptureManager::new(dir.path(), policy);

        // Box entirely outside the frame clips to nothing.
        let result = manager
            .consider_frame(
                1,
                DetectionType::Face,
                &frame(1, 100, 100),
                &bbox(200.0, 200.0, 300.0, 300.0, 0.9, 1),
                30.0,
            )
            .unwrap();
        assert!(result.is_none());
    }
}
