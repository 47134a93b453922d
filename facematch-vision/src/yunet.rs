//! YuNet post-processing.
//!
//! YuNet is anchor-free: every cell of the stride 8/16/32 feature grids
//! predicts one candidate. The 12 output tensors come grouped by kind, then
//! by stride: `cls_8, cls_16, cls_32, obj_8, .., bbox_8, .., kps_8, ..`.
//!
//! For the cell at row `r`, column `c` of a grid with stride `s`:
//! - score = sqrt(clamp(cls) * clamp(obj))
//! - center = ((c + dx) * s, (r + dy) * s)
//! - size = (exp(dw) * s, exp(dh) * s)
//! - landmark k = ((c + kx) * s, (r + ky) * s)
//!
//! Coordinates are returned normalized to `[0, 1]` of the square input.

use anyhow::{Context, Result};
use ndarray::Array2;

pub const STRIDES: [usize; 3] = [8, 16, 32];

const BBOX_COLS: usize = 4;
const KPS_COLS: usize = 10;

#[derive(Debug, Clone)]
pub struct RawDetection {
    pub bbox: [f32; 4], // x, y, w, h
    pub score: f32,
    pub landmarks: [f32; 10],
}

/// The three decoded head outputs for one stride.
#[derive(Debug, Clone)]
pub struct ScaleOutput {
    pub stride: usize,
    pub scores: Vec<f32>,
    pub bboxes: Array2<f32>,
    pub landmarks: Array2<f32>,
}

impl ScaleOutput {
    fn grid(&self, input_size: usize) -> usize {
        input_size / self.stride
    }
}

fn tensor(
    outputs: &[(&[i64], &[f32])],
    index: usize,
    cells: usize,
    cols: usize,
) -> Result<Array2<f32>> {
    let (shape, data) = outputs
        .get(index)
        .with_context(|| format!("missing yunet output {}", index))?;
    if shape.len() != 3 || shape[0] != 1 || shape[1] as usize != cells || shape[2] as usize != cols
    {
        anyhow::bail!(
            "yunet output {} has shape {:?}, expected [1, {}, {}]",
            index,
            shape,
            cells,
            cols
        );
    }
    Ok(Array2::from_shape_vec((cells, cols), data.to_vec())?)
}

/// Group the raw output tensors per stride and fuse class and objectness
/// into a single score.
pub fn parse_outputs(outputs: &[(&[i64], &[f32])], input_size: usize) -> Result<Vec<ScaleOutput>> {
    let n = STRIDES.len();
    if outputs.len() < 4 * n {
        anyhow::bail!("yunet produced {} outputs, expected {}", outputs.len(), 4 * n);
    }

    STRIDES
        .iter()
        .enumerate()
        .map(|(i, &stride)| {
            let side = input_size / stride;
            let cells = side * side;
            let cls = tensor(outputs, i, cells, 1)?;
            let obj = tensor(outputs, i + n, cells, 1)?;
            let scores = cls
                .iter()
                .zip(obj.iter())
                .map(|(c, o)| fuse_score(*c, *o))
                .collect();
            Ok(ScaleOutput {
                stride,
                scores,
                bboxes: tensor(outputs, i + 2 * n, cells, BBOX_COLS)?,
                landmarks: tensor(outputs, i + 3 * n, cells, KPS_COLS)?,
            })
        })
        .collect()
}

pub fn fuse_score(cls: f32, obj: f32) -> f32 {
    (cls.clamp(0.0, 1.0) * obj.clamp(0.0, 1.0)).sqrt()
}

/// Turn grid predictions above `score_threshold` into detections.
pub fn decode_detections(
    scales: &[ScaleOutput],
    score_threshold: f32,
    input_size: usize,
) -> Result<Vec<RawDetection>> {
    let size = input_size as f32;
    let mut detections = Vec::new();

    for scale in scales {
        let side = scale.grid(input_size);
        if scale.scores.len() != side * side {
            anyhow::bail!(
                "stride {} expects a {}x{} grid, got {} cells",
                scale.stride,
                side,
                side,
                scale.scores.len()
            );
        }
        let stride = scale.stride as f32;

        for (idx, &score) in scale.scores.iter().enumerate() {
            if score < score_threshold {
                continue;
            }
            let row = (idx / side) as f32;
            let col = (idx % side) as f32;

            let b = scale.bboxes.row(idx);
            let cx = (col + b[0]) * stride;
            let cy = (row + b[1]) * stride;
            let w = b[2].exp() * stride;
            let h = b[3].exp() * stride;

            let k = scale.landmarks.row(idx);
            let mut landmarks = [0.0f32; 10];
            for p in 0..5 {
                landmarks[p * 2] = (col + k[p * 2]) * stride / size;
                landmarks[p * 2 + 1] = (row + k[p * 2 + 1]) * stride / size;
            }

            detections.push(RawDetection {
                bbox: [
                    (cx - w / 2.0) / size,
                    (cy - h / 2.0) / size,
                    w / size,
                    h / size,
                ],
                score,
                landmarks,
            });
        }
    }

    Ok(detections)
}
