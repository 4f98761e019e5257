//! Multi-object tracker: per-class Kalman tracks with Hungarian matching.
//!
//! State vector per track:
//! ```text
//! [x1, y1, x2, y2, vx1, vy1, vx2, vy2]
//!  ^corners        ^corner velocities
//! ```
//! The covariance is kept diagonal; the full matrix buys nothing at the
//! IoU-matching accuracy this pipeline needs.

use std::collections::HashMap;

use tracing::debug;

use oshield_models::{BoundingBox, DetectionType};

use crate::hungarian::minimum_cost_assignment;

/// Cost assigned to pairs below the IoU threshold so the solver never
/// prefers them over leaving a row unassigned.
const UNMATCHABLE_COST: f64 = 1e6;

/// Configuration for tracker behavior.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// IoU at or above which a detection matches a track
    pub iou_threshold: f64,
    /// Frames a track may coast unmatched before deletion
    pub max_age: u32,
    /// Hits before a track is reported; 0 reports immediately so capture
    /// latency stays at zero
    pub min_hits: u32,
    /// Velocity attenuation applied when a track has coasted
    pub velocity_decay: f64,
    /// Process noise added to the covariance each prediction
    pub process_noise: f64,
    /// Measurement noise used in the correction step
    pub measurement_noise: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            max_age: 30,
            min_hits: 0,
            velocity_decay: 0.95,
            process_noise: 0.03,
            measurement_noise: 0.1,
        }
    }
}

/// One tracked identity with Kalman state.
#[derive(Debug, Clone)]
struct KalmanTrack {
    track_id: u64,
    detection_type: DetectionType,
    /// [x1, y1, x2, y2, vx1, vy1, vx2, vy2]
    state: [f64; 8],
    /// Diagonal covariance
    covariance: [f64; 8],
    last_bbox: BoundingBox,
    last_frame: u64,
    hits: u32,
    age: u32,
}

impl KalmanTrack {
    fn new(track_id: u64, detection_type: DetectionType, bbox: BoundingBox, frame: u64) -> Self {
        let state = [bbox.x1, bbox.y1, bbox.x2, bbox.y2, 0.0, 0.0, 0.0, 0.0];
        Self {
            track_id,
            detection_type,
            state,
            covariance: [1.0, 1.0, 1.0, 1.0, 10.0, 10.0, 10.0, 10.0],
            last_bbox: bbox,
            last_frame: frame,
            hits: 1,
            age: 0,
        }
    }

    /// Advance the state one frame (constant-velocity model).
    fn predict(&mut self, config: &TrackerConfig) {
        if self.age >= 1 {
            for v in &mut self.state[4..] {
                *v *= config.velocity_decay;
            }
        }

        for i in 0..4 {
            self.state[i] += self.state[i + 4];
        }

        // Keep the box logically ordered after prediction.
        if self.state[2] < self.state[0] {
            self.state[2] = self.state[0] + 1.0;
        }
        if self.state[3] < self.state[1] {
            self.state[3] = self.state[1] + 1.0;
        }

        for (i, c) in self.covariance.iter_mut().enumerate() {
            *c += if i < 4 {
                config.process_noise
            } else {
                config.process_noise * 0.1
            };
        }
    }

    /// Predicted box used for matching.
    fn predicted_bbox(&self, frame: u64) -> BoundingBox {
        BoundingBox::new(
            self.state[0],
            self.state[1],
            self.state[2],
            self.state[3],
            self.last_bbox.confidence,
            frame,
        )
    }

    /// Kalman correction with the matched measurement.
    fn update(&mut self, bbox: BoundingBox, frame: u64, config: &TrackerConfig) {
        let measurement = [bbox.x1, bbox.y1, bbox.x2, bbox.y2];

        for i in 0..4 {
            let innovation_var = self.covariance[i] + config.measurement_noise;
            let gain = self.covariance[i] / innovation_var;
            let innovation = measurement[i] - self.state[i];
            self.state[i] += gain * innovation;
            self.state[i + 4] = gain * innovation;
            self.covariance[i] *= 1.0 - gain;
        }

        self.last_bbox = bbox;
        self.last_frame = frame;
        self.hits += 1;
        self.age = 0;
    }
}

/// Per-class multi-object tracker.
pub struct ObjectTracker {
    config: TrackerConfig,
    tracks: HashMap<u64, KalmanTrack>,
    next_id: u64,
}

impl ObjectTracker {
    pub fn new() -> Self {
        Self::with_config(TrackerConfig::default())
    }

    pub fn with_config(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: HashMap::new(),
            next_id: 1,
        }
    }

    /// Number of live tracks.
    pub fn active_count(&self) -> usize {
        self.tracks.len()
    }

    /// Advance one frame: predict, match, update, birth, death.
    ///
    /// Returns every reportable live track as `(track_id, type, last_bbox)`,
    /// coasting tracks included.
    pub fn update(
        &mut self,
        detections: &[(DetectionType, BoundingBox)],
        frame: u64,
    ) -> Vec<(u64, DetectionType, BoundingBox)> {
        // Predict pass: every track ages and advances.
        for track in self.tracks.values_mut() {
            track.age += 1;
            track.predict(&self.config);
        }

        // Group detections by class; matching never crosses classes.
        let mut by_class: HashMap<DetectionType, Vec<&BoundingBox>> = HashMap::new();
        for (ty, bbox) in detections {
            by_class.entry(*ty).or_default().push(bbox);
        }

        for (class, bboxes) in by_class {
            let track_ids: Vec<u64> = self
                .tracks
                .values()
                .filter(|t| t.detection_type == class)
                .map(|t| t.track_id)
                .collect();

            if track_ids.is_empty() {
                for bbox in bboxes {
                    self.create_track(class, (*bbox).clone(), frame);
                }
                continue;
            }

            // IoU cost matrix between predictions and detections.
            let mut cost = vec![vec![UNMATCHABLE_COST; bboxes.len()]; track_ids.len()];
            for (i, tid) in track_ids.iter().enumerate() {
                let predicted = self.tracks[tid].predicted_bbox(frame);
                for (j, det) in bboxes.iter().enumerate() {
                    let iou = predicted.iou(det);
                    if iou >= self.config.iou_threshold {
                        cost[i][j] = 1.0 - iou;
                    }
                }
            }

            let assignment = minimum_cost_assignment(&cost);
            let mut matched_dets = vec![false; bboxes.len()];

            for (i, assigned) in assignment.iter().enumerate() {
                if let Some(j) = assigned {
                    if cost[i][*j] <= 1.0 - self.config.iou_threshold {
                        let tid = track_ids[i];
                        if let Some(track) = self.tracks.get_mut(&tid) {
                            track.update((*bboxes[*j]).clone(), frame, &self.config);
                            matched_dets[*j] = true;
                        }
                    }
                }
            }

            for (j, bbox) in bboxes.iter().enumerate() {
                if !matched_dets[j] {
                    self.create_track(class, (*bbox).clone(), frame);
                }
            }
        }

        // Death pass, then report.
        let max_age = self.config.max_age;
        self.tracks.retain(|_, t| t.age <= max_age);

        let min_hits = self.config.min_hits;
        let mut reported: Vec<(u64, DetectionType, BoundingBox)> = self
            .tracks
            .values()
            .filter(|t| t.hits >= min_hits)
            .map(|t| (t.track_id, t.detection_type, t.last_bbox.clone()))
            .collect();
        reported.sort_by_key(|(tid, _, _)| *tid);
        reported
    }

    fn create_track(&mut self, class: DetectionType, bbox: BoundingBox, frame: u64) {
        let tid = self.next_id;
        self.next_id += 1;
        debug!(track_id = tid, class = %class, frame, "New track");
        self.tracks.insert(tid, KalmanTrack::new(tid, class, bbox, frame));
    }
}

impl Default for ObjectTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x1: f64, y1: f64, x2: f64, y2: f64, frame: u64) -> BoundingBox {
        BoundingBox::new(x1, y1, x2, y2, 0.9, frame)
    }

    #[test]
    fn test_tracks_reported_immediately_with_min_hits_zero() {
        let mut tracker = ObjectTracker::new();
        let reported = tracker.update(
            &[(DetectionType::Face, bbox(100.0, 100.0, 150.0, 160.0, 1))],
            1,
        );
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].1, DetectionType::Face);
    }

    #[test]
    fn test_same_object_keeps_identity() {
        let mut tracker = ObjectTracker::new();
        let first = tracker.update(
            &[(DetectionType::Face, bbox(100.0, 100.0, 150.0, 160.0, 1))],
            1,
        );
        let second = tracker.update(
            &[(DetectionType::Face, bbox(104.0, 102.0, 154.0, 162.0, 2))],
            2,
        );
        assert_eq!(first[0].0, second[0].0);
        assert_eq!(tracker.active_count(), 1);
    }

    #[test]
    fn test_iou_exactly_at_threshold_matches() {
        let config = TrackerConfig::default();
        let mut tracker = ObjectTracker::with_config(config);

        tracker.update(&[(DetectionType::Face, bbox(0.0, 0.0, 100.0, 100.0, 1))], 1);
        // Shifted so IoU with the prediction is just above 0.3:
        // overlap 65x100 over union 135x100 ≈ 0.481, still a match; the
        // threshold acceptance itself is tested directly below.
        let second = tracker.update(&[(DetectionType::Face, bbox(35.0, 0.0, 135.0, 100.0, 2))], 2);
        assert_eq!(tracker.active_count(), 1);
        assert_eq!(second.len(), 1);

        // Direct boundary check on the acceptance predicate.
        let a = bbox(0.0, 0.0, 100.0, 100.0, 1);
        // IoU(a, b) = 30/170... construct exact 0.3: inter/union = 0.3
        // with b = (0,0,x,100): inter = x*100, union = (100 + x - x)*100?
        // Use nested boxes: b inside a with area 0.3 of a.
        let b = BoundingBox::new(0.0, 0.0, 30.0, 100.0, 0.9, 1);
        assert!((a.iou(&b) - 0.3).abs() < 1e-9);
        assert!(a.iou(&b) >= TrackerConfig::default().iou_threshold);
    }

    #[test]
    fn test_classes_never_cross_match() {
        let mut tracker = ObjectTracker::new();
        tracker.update(&[(DetectionType::Face, bbox(0.0, 0.0, 100.0, 100.0, 1))], 1);
        tracker.update(
            &[(DetectionType::Person, bbox(0.0, 0.0, 100.0, 100.0, 2))],
            2,
        );
        // Identical geometry, different class: two tracks.
        assert_eq!(tracker.active_count(), 2);
    }

    #[test]
    fn test_track_dies_after_max_age() {
        let config = TrackerConfig {
            max_age: 3,
            ..Default::default()
        };
        let mut tracker = ObjectTracker::with_config(config);

        tracker.update(&[(DetectionType::Face, bbox(0.0, 0.0, 50.0, 50.0, 1))], 1);
        assert_eq!(tracker.active_count(), 1);

        for frame in 2..=5 {
            tracker.update(&[], frame);
        }
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn test_coasting_track_still_reported() {
        let mut tracker = ObjectTracker::new();
        tracker.update(&[(DetectionType::Face, bbox(0.0, 0.0, 50.0, 50.0, 1))], 1);
        // No detection this frame; the track coasts but is still reported.
        let reported = tracker.update(&[], 2);
        assert_eq!(reported.len(), 1);
    }

    #[test]
    fn test_two_objects_assigned_optimally() {
        let mut tracker = ObjectTracker::new();
        tracker.update(
            &[
                (DetectionType::Face, bbox(0.0, 0.0, 100.0, 100.0, 1)),
                (DetectionType::Face, bbox(300.0, 0.0, 400.0, 100.0, 1)),
            ],
            1,
        );
        let reported = tracker.update(
            &[
                (DetectionType::Face, bbox(305.0, 0.0, 405.0, 100.0, 2)),
                (DetectionType::Face, bbox(5.0, 0.0, 105.0, 100.0, 2)),
            ],
            2,
        );
        // Same two identities, no births.
        assert_eq!(reported.len(), 2);
        assert_eq!(tracker.active_count(), 2);
    }

    #[test]
    fn test_velocity_prediction_follows_motion() {
        let mut tracker = ObjectTracker::new();
        let mut last_id = 0;
        for frame in 1..=5u64 {
            let offset = (frame - 1) as f64 * 12.0;
            let reported = tracker.update(
                &[(
                    DetectionType::Person,
                    bbox(offset, 0.0, 100.0 + offset, 200.0, frame),
                )],
                frame,
            );
            last_id = reported[0].0;
        }
        // Constant motion must never fragment the identity.
        assert_eq!(last_id, 1);
        assert_eq!(tracker.active_count(), 1);
    }
}
