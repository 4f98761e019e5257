//! YOLO-family ONNX decoding for the detector channels.
//!
//! Box models emit `[N, 4 + classes, anchors]`; segmentation models add 32
//! mask coefficients per candidate plus a `[N, 32, 160, 160]` prototype
//! tensor. Decoding, NMS and the mask-to-polygon conversion all live here.

use std::path::Path;
use std::sync::Mutex;

use image::{imageops, ImageBuffer, Rgb};
use ndarray::Array;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{Tensor, Value};
use tracing::info;

use oshield_models::{BoundingBox, DetectionType};

use crate::detect::{DetectorBackend, FrameDetections};
use crate::error::{MediaError, MediaResult};
use crate::reader::Frame;

/// Mask prototype grid side for YOLO segmentation models.
const PROTO_SIDE: usize = 160;
/// Mask activation threshold.
const MASK_THRESHOLD: f32 = 0.5;
/// Row step when tracing the instance polygon.
const POLYGON_ROW_STEP: usize = 2;

/// COCO vehicle class ids kept when a generic model stands in for a plate
/// detector (car, motorcycle, bus, truck).
const VEHICLE_CLASSES: [usize; 4] = [2, 3, 5, 7];

/// What a box model's detections mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxKind {
    /// Dedicated face model; every detection is a face
    Face,
    /// Plate-specialized model; keep all classes as plates
    PlateSpecialized,
    /// Generic COCO model; keep vehicle classes as a plate proxy
    VehicleProxy,
}

/// A raw decoded candidate before NMS.
#[derive(Debug, Clone)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    confidence: f32,
    class_id: usize,
    mask_coeffs: Vec<f32>,
}

impl Candidate {
    fn iou(&self, other: &Candidate) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let area_a = (self.x2 - self.x1) * (self.y2 - self.y1);
        let area_b = (other.x2 - other.x1) * (other.y2 - other.y1);
        let union = area_a + area_b - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Plain bounding-box detector (face, plate, vehicle proxy).
pub struct BoxDetector {
    session: Mutex<Session>,
    kind: BoxKind,
    confidence_threshold: f32,
    nms_threshold: f32,
    input_size: u32,
}

impl BoxDetector {
    pub fn load(
        path: &Path,
        kind: BoxKind,
        confidence_threshold: f32,
        nms_threshold: f32,
        input_size: u32,
    ) -> MediaResult<Self> {
        Ok(Self {
            session: Mutex::new(create_session(path)?),
            kind,
            confidence_threshold,
            nms_threshold,
            input_size,
        })
    }

    /// Run one batched inference and decode per-frame detections.
    pub fn detect_batch(&self, frames: &[Frame]) -> MediaResult<FrameDetections> {
        let input = preprocess_batch(frames, self.input_size)?;
        let (dims, data) = run_session(&self.session, input, "output0")?;

        // [batch, features, anchors]
        let (batch, features, anchors) = batch_dims(&dims)?;
        let num_classes = features.saturating_sub(4);

        let mut out: FrameDetections = FrameDetections::new();
        for (i, frame) in frames.iter().enumerate().take(batch) {
            let plane = &data[i * features * anchors..(i + 1) * features * anchors];
            let mut candidates = decode_boxes(
                plane,
                features,
                anchors,
                num_classes,
                0,
                self.confidence_threshold,
            );
            candidates = non_maximum_suppression(candidates, self.nms_threshold);

            let scale_x = frame.width as f32 / self.input_size as f32;
            let scale_y = frame.height as f32 / self.input_size as f32;

            let mut detections = Vec::new();
            for c in candidates {
                let detection_type = match self.kind {
                    BoxKind::Face => DetectionType::Face,
                    BoxKind::PlateSpecialized => DetectionType::LicensePlate,
                    BoxKind::VehicleProxy => {
                        if VEHICLE_CLASSES.contains(&c.class_id) {
                            DetectionType::LicensePlate
                        } else {
                            continue;
                        }
                    }
                };
                let bbox = BoundingBox::new(
                    (c.x1 * scale_x) as f64,
                    (c.y1 * scale_y) as f64,
                    (c.x2 * scale_x) as f64,
                    (c.y2 * scale_y) as f64,
                    c.confidence as f64,
                    frame.index,
                );
                if bbox.area() >= detection_type.min_area() {
                    detections.push((detection_type, bbox));
                }
            }
            out.insert(frame.index, detections);
        }
        Ok(out)
    }
}

/// Person detector with instance segmentation (YOLO-seg).
pub struct SegDetector {
    session: Mutex<Session>,
    confidence_threshold: f32,
    nms_threshold: f32,
    input_size: u32,
}

impl SegDetector {
    pub fn load(
        path: &Path,
        confidence_threshold: f32,
        nms_threshold: f32,
        input_size: u32,
    ) -> MediaResult<Self> {
        Ok(Self {
            session: Mutex::new(create_session(path)?),
            confidence_threshold,
            nms_threshold,
            input_size,
        })
    }

    /// Run one batched inference; person detections carry a polygon mask
    /// derived from the instance prototypes when available.
    pub fn detect_batch(&self, frames: &[Frame]) -> MediaResult<FrameDetections> {
        let input = preprocess_batch(frames, self.input_size)?;

        let (box_dims, box_data, proto) = {
            let mut session = self
                .session
                .lock()
                .map_err(|_| MediaError::internal("session lock poisoned"))?;
            let outputs = session
                .run(ort::inputs![input])
                .map_err(|e| MediaError::internal(format!("ONNX inference failed: {e}")))?;

            let output0 = outputs
                .get("output0")
                .ok_or_else(|| MediaError::internal("missing output0 tensor"))?;
            let (shape0, data0) = output0
                .try_extract_tensor::<f32>()
                .map_err(|e| MediaError::internal(format!("tensor extract failed: {e}")))?;
            let box_dims: Vec<usize> = shape0.iter().map(|&d| d as usize).collect();
            let box_data: Vec<f32> = data0.to_vec();

            let proto = match outputs.get("output1") {
                Some(output1) => {
                    let (shape1, data1) = output1
                        .try_extract_tensor::<f32>()
                        .map_err(|e| MediaError::internal(format!("tensor extract failed: {e}")))?;
                    let dims: Vec<usize> = shape1.iter().map(|&d| d as usize).collect();
                    Some((dims, data1.to_vec()))
                }
                None => None,
            };
            (box_dims, box_data, proto)
        };

        let (batch, features, anchors) = batch_dims(&box_dims)?;
        let mask_coeff_count = proto
            .as_ref()
            .map(|(dims, _)| dims.get(1).copied().unwrap_or(0))
            .unwrap_or(0);
        let num_classes = features.saturating_sub(4 + mask_coeff_count);

        let mut out: FrameDetections = FrameDetections::new();
        for (i, frame) in frames.iter().enumerate().take(batch) {
            let plane = &box_data[i * features * anchors..(i + 1) * features * anchors];
            let mut candidates = decode_boxes(
                plane,
                features,
                anchors,
                num_classes,
                mask_coeff_count,
                self.confidence_threshold,
            );
            // Person class only (COCO class 0).
            candidates.retain(|c| c.class_id == 0);
            candidates = non_maximum_suppression(candidates, self.nms_threshold);

            let scale_x = frame.width as f32 / self.input_size as f32;
            let scale_y = frame.height as f32 / self.input_size as f32;

            let mut detections = Vec::new();
            for c in &candidates {
                let mut bbox = BoundingBox::new(
                    (c.x1 * scale_x) as f64,
                    (c.y1 * scale_y) as f64,
                    (c.x2 * scale_x) as f64,
                    (c.y2 * scale_y) as f64,
                    c.confidence as f64,
                    frame.index,
                );
                if bbox.area() < DetectionType::Person.min_area() {
                    continue;
                }

                if let Some((proto_dims, proto_data)) = &proto {
                    if let Some(polygon) = instance_polygon(
                        c,
                        proto_dims,
                        proto_data,
                        i,
                        self.input_size,
                        scale_x,
                        scale_y,
                    ) {
                        bbox = bbox.with_mask(polygon);
                    }
                }
                detections.push((DetectionType::Person, bbox));
            }
            out.insert(frame.index, detections);
        }
        Ok(out)
    }
}

impl DetectorBackend for BoxDetector {
    fn detect_batch(&self, frames: &[Frame]) -> MediaResult<FrameDetections> {
        BoxDetector::detect_batch(self, frames)
    }

    fn name(&self) -> &'static str {
        match self.kind {
            BoxKind::Face => "face (ONNX)",
            BoxKind::PlateSpecialized => "plate (specialized)",
            BoxKind::VehicleProxy => "plate (vehicle proxy)",
        }
    }
}

impl DetectorBackend for SegDetector {
    fn detect_batch(&self, frames: &[Frame]) -> MediaResult<FrameDetections> {
        SegDetector::detect_batch(self, frames)
    }

    fn name(&self) -> &'static str {
        "person (YOLO-seg)"
    }
}

/// Decode `[features, anchors]` into thresholded candidates.
fn decode_boxes(
    plane: &[f32],
    features: usize,
    anchors: usize,
    num_classes: usize,
    mask_coeff_count: usize,
    confidence_threshold: f32,
) -> Vec<Candidate> {
    let view = match Array::from_shape_vec((features, anchors), plane.to_vec()) {
        Ok(view) => view,
        Err(_) => return Vec::new(),
    };
    let at = |feature: usize, anchor: usize| view[[feature, anchor]];
    let mut candidates = Vec::new();

    for a in 0..anchors {
        let (class_id, score) = if num_classes <= 1 {
            // Single-score heads (face models): feature 4 is the confidence.
            (0usize, at(4, a))
        } else {
            let mut best = (0usize, 0.0f32);
            for c in 0..num_classes {
                let s = at(4 + c, a);
                if s > best.1 {
                    best = (c, s);
                }
            }
            best
        };

        if score < confidence_threshold {
            continue;
        }

        let cx = at(0, a);
        let cy = at(1, a);
        let w = at(2, a);
        let h = at(3, a);

        let mask_coeffs = if mask_coeff_count > 0 {
            (0..mask_coeff_count)
                .map(|k| at(4 + num_classes + k, a))
                .collect()
        } else {
            Vec::new()
        };

        candidates.push(Candidate {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
            confidence: score,
            class_id,
            mask_coeffs,
        });
    }
    candidates
}

/// Class-aware NMS, highest confidence first.
fn non_maximum_suppression(mut candidates: Vec<Candidate>, threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Candidate> = Vec::new();
    'outer: for candidate in candidates {
        for kept in &keep {
            if kept.class_id == candidate.class_id && kept.iou(&candidate) > threshold {
                continue 'outer;
            }
        }
        keep.push(candidate);
    }
    keep
}

/// Build the instance mask from prototypes and trace its outline as a flat
/// polygon in original image coordinates.
fn instance_polygon(
    candidate: &Candidate,
    proto_dims: &[usize],
    proto_data: &[f32],
    batch_index: usize,
    input_size: u32,
    scale_x: f32,
    scale_y: f32,
) -> Option<Vec<f64>> {
    if proto_dims.len() != 4 || candidate.mask_coeffs.is_empty() {
        return None;
    }
    let coeffs = &candidate.mask_coeffs;
    let (k, proto_h, proto_w) = (proto_dims[1], proto_dims[2], proto_dims[3]);
    if k != coeffs.len() || proto_h != PROTO_SIDE || proto_w != PROTO_SIDE {
        return None;
    }

    let plane = proto_h * proto_w;
    let base = batch_index * k * plane;
    let grid_scale = PROTO_SIDE as f32 / input_size as f32;

    // Mask-grid bounds of the box.
    let gx1 = ((candidate.x1 * grid_scale).floor().max(0.0)) as usize;
    let gy1 = ((candidate.y1 * grid_scale).floor().max(0.0)) as usize;
    let gx2 = ((candidate.x2 * grid_scale).ceil() as usize).min(PROTO_SIDE - 1);
    let gy2 = ((candidate.y2 * grid_scale).ceil() as usize).min(PROTO_SIDE - 1);
    if gx2 <= gx1 || gy2 <= gy1 {
        return None;
    }

    let mask_at = |x: usize, y: usize| -> f32 {
        let mut sum = 0.0f32;
        for (ki, coeff) in coeffs.iter().enumerate() {
            sum += coeff * proto_data[base + ki * plane + y * proto_w + x];
        }
        1.0 / (1.0 + (-sum).exp())
    };

    // Trace left and right edges per sampled row.
    let mut left_edge: Vec<(f64, f64)> = Vec::new();
    let mut right_edge: Vec<(f64, f64)> = Vec::new();
    let to_image = |gx: usize, gy: usize| -> (f64, f64) {
        (
            (gx as f32 / grid_scale * scale_x) as f64,
            (gy as f32 / grid_scale * scale_y) as f64,
        )
    };

    for gy in (gy1..=gy2).step_by(POLYGON_ROW_STEP) {
        let mut row_min = None;
        let mut row_max = None;
        for gx in gx1..=gx2 {
            if mask_at(gx, gy) > MASK_THRESHOLD {
                if row_min.is_none() {
                    row_min = Some(gx);
                }
                row_max = Some(gx);
            }
        }
        if let (Some(min_x), Some(max_x)) = (row_min, row_max) {
            left_edge.push(to_image(min_x, gy));
            right_edge.push(to_image(max_x, gy));
        }
    }

    if left_edge.len() < 2 {
        return None;
    }

    // Down the left edge, back up the right edge.
    let mut polygon = Vec::with_capacity((left_edge.len() + right_edge.len()) * 2);
    for (x, y) in &left_edge {
        polygon.push(*x);
        polygon.push(*y);
    }
    for (x, y) in right_edge.iter().rev() {
        polygon.push(*x);
        polygon.push(*y);
    }
    Some(polygon)
}

/// Resize a batch to the model input and pack it as NCHW `[N, 3, S, S]`.
fn preprocess_batch(frames: &[Frame], input_size: u32) -> MediaResult<Value> {
    let size = input_size as usize;
    let mut data: Vec<f32> = Vec::with_capacity(frames.len() * 3 * size * size);

    for frame in frames {
        let buffer: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_raw(frame.width, frame.height, frame.data.clone())
                .ok_or_else(|| MediaError::internal("invalid frame buffer"))?;
        let resized = imageops::resize(
            &buffer,
            input_size,
            input_size,
            imageops::FilterType::Triangle,
        );

        for c in 0..3usize {
            for y in 0..size {
                for x in 0..size {
                    let pixel = resized.get_pixel(x as u32, y as u32);
                    data.push(pixel[c] as f32 / 255.0);
                }
            }
        }
    }

    let shape = vec![frames.len(), 3, size, size];
    Tensor::from_array((shape, data.into_boxed_slice()))
        .map(Value::from)
        .map_err(|e| MediaError::internal(format!("failed to create tensor: {e}")))
}

/// Run a session and extract one named output tensor.
fn run_session(
    session: &Mutex<Session>,
    input: Value,
    output_name: &str,
) -> MediaResult<(Vec<usize>, Vec<f32>)> {
    let mut session = session
        .lock()
        .map_err(|_| MediaError::internal("session lock poisoned"))?;
    let outputs = session
        .run(ort::inputs![input])
        .map_err(|e| MediaError::internal(format!("ONNX inference failed: {e}")))?;

    let output = outputs
        .get(output_name)
        .ok_or_else(|| MediaError::internal(format!("missing {output_name} tensor")))?;
    let (shape, data) = output
        .try_extract_tensor::<f32>()
        .map_err(|e| MediaError::internal(format!("tensor extract failed: {e}")))?;

    Ok((shape.iter().map(|&d| d as usize).collect(), data.to_vec()))
}

fn batch_dims(dims: &[usize]) -> MediaResult<(usize, usize, usize)> {
    if dims.len() != 3 {
        return Err(MediaError::internal(format!(
            "unexpected output rank {} (want [batch, features, anchors])",
            dims.len()
        )));
    }
    Ok((dims[0], dims[1], dims[2]))
}

/// Create an ONNX Runtime session; CUDA when built with the `cuda` feature
/// and available, CPU otherwise.
fn create_session(model_path: &Path) -> MediaResult<Session> {
    let model_bytes = std::fs::read(model_path)
        .map_err(|_| MediaError::model_not_found(model_path.display().to_string()))?;

    let builder = Session::builder()
        .map_err(|e| MediaError::internal(format!("failed to create session builder: {e}")))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| MediaError::internal(format!("failed to set optimization level: {e}")))?;

    #[cfg(all(target_os = "linux", feature = "cuda"))]
    {
        use ort::execution_providers::CUDAExecutionProvider;
        if let Ok(cuda_builder) = builder
            .clone()
            .with_execution_providers([CUDAExecutionProvider::default().build()])
        {
            if let Ok(session) = cuda_builder.commit_from_memory(&model_bytes) {
                info!("Using CUDA execution provider");
                return Ok(session);
            }
        }
        tracing::debug!("CUDA execution provider unavailable, falling back to CPU");
    }

    info!(model = %model_path.display(), "Using CPU execution provider");
    builder
        .commit_from_memory(&model_bytes)
        .map_err(|e| MediaError::internal(format!("failed to load ONNX model: {e}")))
}

/// Haar-cascade fallback when no dedicated face model is present.
#[cfg(feature = "opencv")]
pub fn detect_faces_cascade(
    frame: &Frame,
    confidence: f32,
) -> MediaResult<Vec<(DetectionType, BoundingBox)>> {
    use opencv::{core, imgproc, objdetect, prelude::*};

    let mat = Mat::from_slice(&frame.data)
        .map_err(|e| MediaError::detection_failed(e.to_string()))?
        .reshape(3, frame.height as i32)
        .map_err(|e| MediaError::detection_failed(e.to_string()))?
        .try_clone()
        .map_err(|e| MediaError::detection_failed(e.to_string()))?;

    let mut gray = Mat::default();
    imgproc::cvt_color(&mat, &mut gray, imgproc::COLOR_RGB2GRAY, 0)
        .map_err(|e| MediaError::detection_failed(e.to_string()))?;

    let mut cascade = objdetect::CascadeClassifier::new(
        "/usr/share/opencv4/haarcascades/haarcascade_frontalface_default.xml",
    )
    .map_err(|e| MediaError::detection_failed(e.to_string()))?;

    let mut faces = core::Vector::<core::Rect>::new();
    cascade
        .detect_multi_scale(
            &gray,
            &mut faces,
            1.1,
            5,
            0,
            core::Size::new(30, 30),
            core::Size::new(0, 0),
        )
        .map_err(|e| MediaError::detection_failed(e.to_string()))?;

    let _ = confidence;
    let mut out = Vec::new();
    for rect in faces {
        let bbox = BoundingBox::new(
            rect.x as f64,
            rect.y as f64,
            (rect.x + rect.width) as f64,
            (rect.y + rect.height) as f64,
            0.8,
            frame.index,
        );
        if bbox.area() >= DetectionType::Face.min_area() {
            out.push((DetectionType::Face, bbox));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32, class_id: usize) -> Candidate {
        Candidate {
            x1,
            y1,
            x2,
            y2,
            confidence,
            class_id,
            mask_coeffs: Vec::new(),
        }
    }

    #[test]
    fn test_decode_multiclass_plane() {
        // 2 anchors, 4 + 2 classes.
        let features = 6;
        let anchors = 2;
        let mut plane = vec![0.0f32; features * anchors];
        // Anchor 0: box at (100,100) size 40x60, class 1 score 0.9.
        plane[0] = 100.0;
        plane[anchors] = 100.0;
        plane[2 * anchors] = 40.0;
        plane[3 * anchors] = 60.0;
        plane[4 * anchors] = 0.1;
        plane[5 * anchors] = 0.9;
        // Anchor 1 stays below threshold.

        let candidates = decode_boxes(&plane, features, anchors, 2, 0, 0.5);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].class_id, 1);
        assert!((candidates[0].x1 - 80.0).abs() < 1e-4);
        assert!((candidates[0].y2 - 130.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_single_score_head() {
        // Face-style head: 4 box features + 1 score.
        let features = 5;
        let anchors = 1;
        let plane = vec![50.0, 50.0, 20.0, 20.0, 0.7];
        let candidates = decode_boxes(&plane, features, anchors, 1, 0, 0.5);
        assert_eq!(candidates.len(), 1);
        assert!((candidates[0].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_same_class_overlap() {
        let candidates = vec![
            candidate(0.0, 0.0, 100.0, 100.0, 0.9, 0),
            candidate(5.0, 5.0, 105.0, 105.0, 0.8, 0),
            candidate(0.0, 0.0, 100.0, 100.0, 0.7, 1),
        ];
        let kept = non_maximum_suppression(candidates, 0.45);
        // Overlapping same-class candidate goes; other class stays.
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_disjoint_boxes() {
        let candidates = vec![
            candidate(0.0, 0.0, 50.0, 50.0, 0.9, 0),
            candidate(200.0, 200.0, 260.0, 260.0, 0.85, 0),
        ];
        let kept = non_maximum_suppression(candidates, 0.45);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_batch_dims_validation() {
        assert!(batch_dims(&[1, 84, 8400]).is_ok());
        assert!(batch_dims(&[84, 8400]).is_err());
    }
}
