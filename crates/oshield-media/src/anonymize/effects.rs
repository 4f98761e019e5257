//! Pixel kernels for the anonymization effects.
//!
//! All kernels operate in place on an RGB24 frame buffer, restricted to a
//! clipped region of interest. Pixelation noise and the scramble permutation
//! are seeded, so the same inputs always produce the same bytes.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// Noise amplitude added to pixelation blocks.
const NOISE_AMPLITUDE: i16 = 16;

/// A clipped region of interest inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Clip a bbox `[x1, y1, x2, y2]` to frame bounds. `None` when nothing is
/// left after clipping.
pub fn clip_rect(frame_width: u32, frame_height: u32, bbox: &[f64; 4]) -> Option<Roi> {
    let x1 = bbox[0].max(0.0) as u32;
    let y1 = bbox[1].max(0.0) as u32;
    let x2 = (bbox[2].min(frame_width as f64)) as u32;
    let y2 = (bbox[3].min(frame_height as f64)) as u32;
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(Roi {
        x: x1,
        y: y1,
        width: x2 - x1,
        height: y2 - y1,
    })
}

/// Extract a ROI as interleaved RGB f32.
fn extract_roi(frame: &[u8], frame_width: u32, roi: &Roi) -> Vec<f32> {
    let stride = frame_width as usize * 3;
    let mut out = Vec::with_capacity(roi.width as usize * roi.height as usize * 3);
    for row in 0..roi.height as usize {
        let start = (roi.y as usize + row) * stride + roi.x as usize * 3;
        out.extend(
            frame[start..start + roi.width as usize * 3]
                .iter()
                .map(|&b| b as f32),
        );
    }
    out
}

/// Write a ROI buffer back, blending with the original through an optional
/// mask (`out = original * (1 - m) + effect * m`).
fn write_roi(frame: &mut [u8], frame_width: u32, roi: &Roi, effect: &[f32], mask: Option<&[f32]>) {
    let stride = frame_width as usize * 3;
    let roi_w = roi.width as usize;
    for row in 0..roi.height as usize {
        let start = (roi.y as usize + row) * stride + roi.x as usize * 3;
        for col in 0..roi_w {
            let src = (row * roi_w + col) * 3;
            let m = mask.map(|m| m[row * roi_w + col]).unwrap_or(1.0);
            for c in 0..3 {
                let original = frame[start + col * 3 + c] as f32;
                let value = original * (1.0 - m) + effect[src + c] * m;
                frame[start + col * 3 + c] = value.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

/// Gaussian blur over a ROI with a separable kernel. Even kernel sizes are
/// forced odd.
pub fn gaussian_blur_region(
    frame: &mut [u8],
    frame_width: u32,
    roi: &Roi,
    kernel_size: u32,
    sigma: f64,
    mask: Option<&[f32]>,
) {
    let kernel_size = if kernel_size % 2 == 0 {
        kernel_size + 1
    } else {
        kernel_size
    };
    let kernel = gaussian_kernel(kernel_size as usize, sigma);
    let half = kernel.len() / 2;

    let roi_w = roi.width as usize;
    let roi_h = roi.height as usize;
    let source = extract_roi(frame, frame_width, roi);

    // Horizontal pass, rows in parallel.
    let mut horizontal = vec![0.0f32; source.len()];
    horizontal
        .par_chunks_mut(roi_w * 3)
        .enumerate()
        .for_each(|(row, out_row)| {
            for col in 0..roi_w {
                for c in 0..3 {
                    let mut acc = 0.0f32;
                    for (k, weight) in kernel.iter().enumerate() {
                        let sample = (col as isize + k as isize - half as isize)
                            .clamp(0, roi_w as isize - 1) as usize;
                        acc += source[(row * roi_w + sample) * 3 + c] * *weight as f32;
                    }
                    out_row[col * 3 + c] = acc;
                }
            }
        });

    // Vertical pass.
    let mut blurred = vec![0.0f32; source.len()];
    blurred
        .par_chunks_mut(roi_w * 3)
        .enumerate()
        .for_each(|(row, out_row)| {
            for col in 0..roi_w {
                for c in 0..3 {
                    let mut acc = 0.0f32;
                    for (k, weight) in kernel.iter().enumerate() {
                        let sample = (row as isize + k as isize - half as isize)
                            .clamp(0, roi_h as isize - 1) as usize;
                        acc += horizontal[(sample * roi_w + col) * 3 + c] * *weight as f32;
                    }
                    out_row[col * 3 + c] = acc;
                }
            }
        });

    write_roi(frame, frame_width, roi, &blurred, mask);
}

fn gaussian_kernel(size: usize, sigma: f64) -> Vec<f64> {
    let sigma = if sigma <= 0.0 {
        // OpenCV's convention for auto sigma from kernel size.
        0.3 * ((size as f64 - 1.0) * 0.5 - 1.0) + 0.8
    } else {
        sigma
    };
    let half = (size / 2) as f64;
    let mut kernel: Vec<f64> = (0..size)
        .map(|i| {
            let d = i as f64 - half;
            (-d * d / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= sum;
    }
    kernel
}

/// Stable additive noise for pixelation, keyed by `(track_id, blocks)`.
///
/// The same key always yields the same tensor, so the mosaic pattern holds
/// still across the frames of one track instead of shimmering.
pub fn stable_noise(track_id: u64, blocks: u32) -> Vec<i16> {
    let seed = track_id
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(blocks as u64);
    let mut rng = StdRng::seed_from_u64(seed);
    (0..(blocks as usize * blocks as usize * 3))
        .map(|_| rng.gen_range(-NOISE_AMPLITUDE..=NOISE_AMPLITUDE))
        .collect()
}

/// Mosaic pixelation: average-pool to `blocks × blocks`, add the track's
/// stable noise, clamp, and upsample nearest-neighbor.
pub fn pixelate_region(
    frame: &mut [u8],
    frame_width: u32,
    roi: &Roi,
    blocks: u32,
    track_id: u64,
    mask: Option<&[f32]>,
) {
    let blocks = blocks.max(1).min(roi.width).min(roi.height).max(1);
    let source = extract_roi(frame, frame_width, roi);
    let roi_w = roi.width as usize;
    let roi_h = roi.height as usize;
    let noise = stable_noise(track_id, blocks);

    let b = blocks as usize;
    let mut cells = vec![0.0f32; b * b * 3];
    for by in 0..b {
        let y0 = by * roi_h / b;
        let y1 = ((by + 1) * roi_h / b).max(y0 + 1);
        for bx in 0..b {
            let x0 = bx * roi_w / b;
            let x1 = ((bx + 1) * roi_w / b).max(x0 + 1);
            let count = ((y1 - y0) * (x1 - x0)) as f32;
            for c in 0..3 {
                let mut acc = 0.0f32;
                for y in y0..y1 {
                    for x in x0..x1 {
                        acc += source[(y * roi_w + x) * 3 + c];
                    }
                }
                let cell = acc / count + noise[(by * b + bx) * 3 + c] as f32;
                cells[(by * b + bx) * 3 + c] = cell.clamp(0.0, 255.0);
            }
        }
    }

    let mut effect = vec![0.0f32; source.len()];
    for y in 0..roi_h {
        let by = (y * b / roi_h).min(b - 1);
        for x in 0..roi_w {
            let bx = (x * b / roi_w).min(b - 1);
            for c in 0..3 {
                effect[(y * roi_w + x) * 3 + c] = cells[(by * b + bx) * 3 + c];
            }
        }
    }

    write_roi(frame, frame_width, roi, &effect, mask);
}

/// Scramble mask: a deterministic permutation of the ROI's pixels under a
/// seeded PRNG. No mask blending.
pub fn scramble_region(frame: &mut [u8], frame_width: u32, roi: &Roi, seed: u64) {
    let source = extract_roi(frame, frame_width, roi);
    let pixel_count = roi.width as usize * roi.height as usize;

    let mut permutation: Vec<usize> = (0..pixel_count).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    permutation.shuffle(&mut rng);

    let mut effect = vec![0.0f32; source.len()];
    for (dst, src) in permutation.iter().enumerate() {
        for c in 0..3 {
            effect[dst * 3 + c] = source[src * 3 + c];
        }
    }

    write_roi(frame, frame_width, roi, &effect, None);
}

/// Rasterize a flat polygon `[x, y, x, y, …]` (frame coordinates) into a
/// soft mask over the ROI using even-odd scanline filling.
pub fn rasterize_polygon(polygon: &[f64], roi: &Roi) -> Vec<f32> {
    let roi_w = roi.width as usize;
    let roi_h = roi.height as usize;
    let mut mask = vec![0.0f32; roi_w * roi_h];
    if polygon.len() < 6 {
        return mask;
    }

    let points: Vec<(f64, f64)> = polygon
        .chunks_exact(2)
        .map(|p| (p[0] - roi.x as f64, p[1] - roi.y as f64))
        .collect();

    for row in 0..roi_h {
        let y = row as f64 + 0.5;
        // Gather x-crossings of every edge with this scanline.
        let mut crossings: Vec<f64> = Vec::new();
        for i in 0..points.len() {
            let (x1, y1) = points[i];
            let (x2, y2) = points[(i + 1) % points.len()];
            if (y1 <= y && y2 > y) || (y2 <= y && y1 > y) {
                let t = (y - y1) / (y2 - y1);
                crossings.push(x1 + t * (x2 - x1));
            }
        }
        crossings.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        for pair in crossings.chunks_exact(2) {
            let start = pair[0].max(0.0) as usize;
            let end = (pair[1].min(roi_w as f64)) as usize;
            for col in start..end.min(roi_w) {
                mask[row * roi_w + col] = 1.0;
            }
        }
    }
    mask
}
