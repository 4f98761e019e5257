//! Detection geometry and tracked objects.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Minimum detection area for faces (px²); smaller boxes are noise.
pub const MIN_FACE_AREA: f64 = 200.0;
/// Minimum detection area for everything else (px²).
pub const MIN_DETECTION_AREA: f64 = 500.0;

/// Category of a detected object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DetectionType {
    Face,
    Person,
    LicensePlate,
    Fingerprint,
    IdDocument,
    CreditCard,
    HandBiometric,
    Signature,
    Hand,
    HandCrop,
    Unknown,
}

impl DetectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionType::Face => "face",
            DetectionType::Person => "person",
            DetectionType::LicensePlate => "license_plate",
            DetectionType::Fingerprint => "fingerprint",
            DetectionType::IdDocument => "id_document",
            DetectionType::CreditCard => "credit_card",
            DetectionType::HandBiometric => "hand_biometric",
            DetectionType::Signature => "signature",
            DetectionType::Hand => "hand",
            DetectionType::HandCrop => "hand_crop",
            DetectionType::Unknown => "unknown",
        }
    }

    /// Minimum area below which detections of this type are discarded.
    pub fn min_area(&self) -> f64 {
        match self {
            DetectionType::Face => MIN_FACE_AREA,
            _ => MIN_DETECTION_AREA,
        }
    }

    /// Classes that need a classification sub-call before verification.
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            DetectionType::Unknown | DetectionType::Hand | DetectionType::HandCrop
        )
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "face" => DetectionType::Face,
            "person" => DetectionType::Person,
            "license_plate" => DetectionType::LicensePlate,
            "fingerprint" => DetectionType::Fingerprint,
            "id_document" => DetectionType::IdDocument,
            "credit_card" => DetectionType::CreditCard,
            "hand_biometric" => DetectionType::HandBiometric,
            "signature" => DetectionType::Signature,
            "hand" => DetectionType::Hand,
            "hand_crop" => DetectionType::HandCrop,
            _ => DetectionType::Unknown,
        }
    }
}

impl fmt::Display for DetectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Axis-aligned bounding box in pixel coordinates with an optional
/// segmentation polygon (flattened `[x, y, x, y, …]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    pub confidence: f64,
    pub frame: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<Vec<f64>>,
}

impl BoundingBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64, confidence: f64, frame: u64) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            confidence,
            frame,
            mask: None,
        }
    }

    pub fn with_mask(mut self, mask: Vec<f64>) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x1 + self.width() / 2.0, self.y1 + self.height() / 2.0)
    }

    pub fn to_int_tuple(&self) -> (i64, i64, i64, i64) {
        (
            self.x1 as i64,
            self.y1 as i64,
            self.x2 as i64,
            self.y2 as i64,
        )
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let xl = self.x1.max(other.x1);
        let yt = self.y1.max(other.y1);
        let xr = self.x2.min(other.x2);
        let yb = self.y2.min(other.y2);
        if xr < xl || yb < yt {
            return 0.0;
        }
        let inter = (xr - xl) * (yb - yt);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// A still image saved from a track at a chosen frame.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Capture {
    pub frame: u64,
    pub image_path: String,
    pub bbox: BoundingBox,
    pub reason: String,
    pub timestamp: f64,
}

/// A tracked object: one identity across frames, with its box history and
/// the captures taken from it. Owned by the tracker during detection, then
/// read-only.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TrackedObject {
    pub track_id: u64,
    pub detection_type: DetectionType,
    #[serde(default)]
    pub bbox_history: Vec<BoundingBox>,
    #[serde(default)]
    pub captures: Vec<Capture>,
}

impl TrackedObject {
    pub fn new(track_id: u64, detection_type: DetectionType) -> Self {
        Self {
            track_id,
            detection_type,
            bbox_history: Vec::new(),
            captures: Vec::new(),
        }
    }

    pub fn first_frame(&self) -> u64 {
        self.bbox_history.first().map(|b| b.frame).unwrap_or(0)
    }

    pub fn last_frame(&self) -> u64 {
        self.bbox_history.last().map(|b| b.frame).unwrap_or(0)
    }

    pub fn last_bbox(&self) -> Option<&BoundingBox> {
        self.bbox_history.last()
    }

    pub fn avg_confidence(&self) -> f64 {
        if self.bbox_history.is_empty() {
            return 0.0;
        }
        self.bbox_history.iter().map(|b| b.confidence).sum::<f64>()
            / self.bbox_history.len() as f64
    }

    pub fn max_confidence(&self) -> f64 {
        self.bbox_history
            .iter()
            .map(|b| b.confidence)
            .fold(0.0, f64::max)
    }

    /// Capture with the highest box confidence.
    pub fn best_capture(&self) -> Option<&Capture> {
        self.captures.iter().max_by(|a, b| {
            a.bbox
                .confidence
                .partial_cmp(&b.bbox.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    }

    /// Append a box; history frames are strictly increasing.
    pub fn add_bbox(&mut self, bbox: BoundingBox) {
        debug_assert!(
            self.bbox_history
                .last()
                .map(|last| bbox.frame > last.frame)
                .unwrap_or(true),
            "bbox history must be strictly increasing in frame number"
        );
        self.bbox_history.push(bbox);
    }

    /// Track duration in seconds at the given frame rate.
    pub fn duration_seconds(&self, fps: f64) -> f64 {
        if fps <= 0.0 || self.last_frame() <= self.first_frame() {
            return 0.0;
        }
        (self.last_frame() - self.first_frame()) as f64 / fps
    }
}

/// Output of the detection phase for one video.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DetectionResult {
    pub video_path: String,
    pub total_frames: u64,
    pub fps: f64,
    pub duration_seconds: f64,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub detections: Vec<TrackedObject>,
    #[serde(default)]
    pub frames_processed: u64,
    #[serde(default)]
    pub processing_time_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x1: f64, y1: f64, x2: f64, y2: f64, conf: f64, frame: u64) -> BoundingBox {
        BoundingBox::new(x1, y1, x2, y2, conf, frame)
    }

    #[test]
    fn test_bbox_geometry() {
        let b = bbox(10.0, 20.0, 110.0, 70.0, 0.9, 5);
        assert_eq!(b.width(), 100.0);
        assert_eq!(b.height(), 50.0);
        assert_eq!(b.area(), 5000.0);
        assert_eq!(b.center(), (60.0, 45.0));
    }

    #[test]
    fn test_iou_disjoint_and_identical() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 0.9, 0);
        let b = bbox(20.0, 20.0, 30.0, 30.0, 0.9, 0);
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_iou_partial_overlap() {
        let a = bbox(0.0, 0.0, 100.0, 100.0, 0.9, 0);
        let b = bbox(50.0, 50.0, 150.0, 150.0, 0.9, 0);
        // 2500 / 17500
        assert!((a.iou(&b) - 0.142857).abs() < 1e-4);
    }

    #[test]
    fn test_track_derived_values() {
        let mut t = TrackedObject::new(1, DetectionType::Face);
        t.add_bbox(bbox(0.0, 0.0, 10.0, 10.0, 0.6, 3));
        t.add_bbox(bbox(1.0, 1.0, 11.0, 11.0, 0.8, 4));
        t.add_bbox(bbox(2.0, 2.0, 12.0, 12.0, 0.7, 5));

        assert_eq!(t.first_frame(), 3);
        assert_eq!(t.last_frame(), 5);
        assert!((t.avg_confidence() - 0.7).abs() < 1e-9);
        assert!((t.max_confidence() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_best_capture_is_argmax_confidence() {
        let mut t = TrackedObject::new(1, DetectionType::Face);
        for (frame, conf) in [(10u64, 0.5), (40, 0.95), (70, 0.7)] {
            t.captures.push(Capture {
                frame,
                image_path: format!("capture_{frame}.jpg"),
                bbox: bbox(0.0, 0.0, 30.0, 30.0, conf, frame),
                reason: "periodic".to_string(),
                timestamp: frame as f64 / 30.0,
            });
        }
        assert_eq!(t.best_capture().map(|c| c.frame), Some(40));
    }

    #[test]
    fn test_captures_within_track_window() {
        let mut t = TrackedObject::new(1, DetectionType::Person);
        t.add_bbox(bbox(0.0, 0.0, 50.0, 50.0, 0.9, 10));
        t.add_bbox(bbox(0.0, 0.0, 50.0, 50.0, 0.9, 90));
        t.captures.push(Capture {
            frame: 45,
            image_path: "capture_45.jpg".to_string(),
            bbox: bbox(0.0, 0.0, 50.0, 50.0, 0.9, 45),
            reason: "periodic".to_string(),
            timestamp: 1.5,
        });
        for c in &t.captures {
            assert!(t.first_frame() <= c.frame && c.frame <= t.last_frame());
        }
    }

    #[test]
    fn test_min_area_by_type() {
        assert_eq!(DetectionType::Face.min_area(), 200.0);
        assert_eq!(DetectionType::Person.min_area(), 500.0);
        assert_eq!(DetectionType::LicensePlate.min_area(), 500.0);
    }

    #[test]
    fn test_ambiguous_types() {
        assert!(DetectionType::Unknown.is_ambiguous());
        assert!(DetectionType::Hand.is_ambiguous());
        assert!(DetectionType::HandCrop.is_ambiguous());
        assert!(!DetectionType::Face.is_ambiguous());
    }

    #[test]
    fn test_parse_roundtrip() {
        for ty in [
            DetectionType::Face,
            DetectionType::Person,
            DetectionType::LicensePlate,
            DetectionType::Signature,
        ] {
            assert_eq!(DetectionType::parse(ty.as_str()), ty);
        }
        assert_eq!(DetectionType::parse("whatever"), DetectionType::Unknown);
    }
}
