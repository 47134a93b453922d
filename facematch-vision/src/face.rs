use std::cmp::Ordering;

use crate::yunet;
use anyhow::Result;
use image::{imageops::FilterType, DynamicImage, GenericImageView, Rgb, RgbImage};
use ndarray::{Array4, ArrayView1};
use ort::{session::Session, value::Value};

/// Length of an SFace descriptor.
pub const EMBEDDING_DIM: usize = 128;

/// Square input side YuNet is run at.
pub const DETECTOR_INPUT: u32 = 640;

/// Square input side SFace expects.
pub const ALIGNED_SIZE: u32 = 112;

/// Detection result from YuNet, in source image pixels
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: [f32; 4], // x, y, w, h
    pub score: f32,
    pub landmarks: [f32; 10], // right eye, left eye, nose, mouth corners
}

impl Detection {
    pub fn area(&self) -> f32 {
        self.bbox[2].max(0.0) * self.bbox[3].max(0.0)
    }
}

/// A unit-length face descriptor.
///
/// Only [`FaceEmbedding::from_raw`] creates one, so every value has an L2
/// norm of 1 (within float rounding). A raw vector without a usable norm
/// never becomes an embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceEmbedding {
    values: Vec<f32>,
}

impl FaceEmbedding {
    /// Normalize a raw descriptor. Returns `None` for an empty vector or one
    /// whose norm is zero or not finite.
    pub fn from_raw(mut raw: Vec<f32>) -> Option<Self> {
        let norm = l2_norm(&raw);
        if raw.is_empty() || !norm.is_finite() || norm <= f32::EPSILON {
            return None;
        }
        raw.iter_mut().for_each(|v| *v /= norm);
        Some(Self { values: raw })
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn view(&self) -> ArrayView1<'_, f32> {
        ArrayView1::from(self.values.as_slice())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn norm(&self) -> f32 {
        l2_norm(&self.values)
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.values
    }
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Image → NCHW tensor in BGR order with raw 0..255 values, the layout both
/// YuNet and SFace take.
fn bgr_tensor(img: &RgbImage) -> Array4<f32> {
    let (w, h) = img.dimensions();
    Array4::from_shape_fn((1, 3, h as usize, w as usize), |(_, c, y, x)| {
        img.get_pixel(x as u32, y as u32)[2 - c] as f32
    })
}

/// Where the source image sits inside the padded square detector input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    offset_x: f32,
    offset_y: f32,
}

impl Letterbox {
    fn unmap_x(&self, normalized: f32) -> f32 {
        (normalized * DETECTOR_INPUT as f32 - self.offset_x) / self.scale
    }

    fn unmap_y(&self, normalized: f32) -> f32 {
        (normalized * DETECTOR_INPUT as f32 - self.offset_y) / self.scale
    }

    fn unmap_len(&self, normalized: f32) -> f32 {
        normalized * DETECTOR_INPUT as f32 / self.scale
    }
}

/// Grayscale, resize keeping the aspect ratio, and center on a black square.
fn letterbox_gray(img: &DynamicImage) -> (RgbImage, Letterbox) {
    let (w, h) = img.dimensions();
    let scale = DETECTOR_INPUT as f32 / w.max(h) as f32;
    let new_w = ((w as f32 * scale) as u32).clamp(1, DETECTOR_INPUT);
    let new_h = ((h as f32 * scale) as u32).clamp(1, DETECTOR_INPUT);

    let gray = DynamicImage::ImageLuma8(img.to_luma8());
    let resized = gray.resize_exact(new_w, new_h, FilterType::Triangle).to_rgb8();

    let offset_x = (DETECTOR_INPUT - new_w) / 2;
    let offset_y = (DETECTOR_INPUT - new_h) / 2;
    let mut canvas = RgbImage::new(DETECTOR_INPUT, DETECTOR_INPUT);
    image::imageops::overlay(&mut canvas, &resized, offset_x as i64, offset_y as i64);

    (
        canvas,
        Letterbox {
            scale,
            offset_x: offset_x as f32,
            offset_y: offset_y as f32,
        },
    )
}

/// Detect faces with YuNet. The detector sees a grayscale copy of `img`;
/// returned boxes and landmarks are in `img` pixel coordinates and come in
/// canonical order (see [`canonical_order`]).
pub fn detect_faces(
    session: &mut Session,
    img: &DynamicImage,
    score_threshold: f32,
    nms_threshold: f32,
) -> Result<Vec<Detection>> {
    let (canvas, letterbox) = letterbox_gray(img);
    let input = Value::from_array(bgr_tensor(&canvas))?;
    let outputs = session.run(ort::inputs![input])?;

    let mut owned: Vec<(Vec<i64>, Vec<f32>)> = Vec::new();
    for (_name, output) in outputs.iter() {
        let (shape, data) = output.try_extract_tensor::<f32>()?;
        owned.push((shape.iter().copied().collect(), data.to_vec()));
    }
    let refs: Vec<(&[i64], &[f32])> = owned
        .iter()
        .map(|(s, d)| (s.as_slice(), d.as_slice()))
        .collect();

    let scales = yunet::parse_outputs(&refs, DETECTOR_INPUT as usize)?;
    let raw = yunet::decode_detections(&scales, score_threshold, DETECTOR_INPUT as usize)?;

    let mut detections: Vec<Detection> = raw
        .into_iter()
        .map(|d| {
            let mut landmarks = [0.0f32; 10];
            for p in 0..5 {
                landmarks[p * 2] = letterbox.unmap_x(d.landmarks[p * 2]);
                landmarks[p * 2 + 1] = letterbox.unmap_y(d.landmarks[p * 2 + 1]);
            }
            Detection {
                bbox: [
                    letterbox.unmap_x(d.bbox[0]),
                    letterbox.unmap_y(d.bbox[1]),
                    letterbox.unmap_len(d.bbox[2]),
                    letterbox.unmap_len(d.bbox[3]),
                ],
                score: d.score,
                landmarks,
            }
        })
        .collect();

    if nms_threshold < 1.0 {
        detections = nms(&detections, nms_threshold);
    }
    canonical_order(&mut detections);

    Ok(detections)
}

/// Sort detections so the first one is the most prominent face: largest box
/// area, then highest score, then top-most, then left-most. Detector output
/// order is not stable across runs, this order is.
pub fn canonical_order(detections: &mut [Detection]) {
    detections.sort_by(|a, b| {
        b.area()
            .total_cmp(&a.area())
            .then_with(|| b.score.total_cmp(&a.score))
            .then_with(|| a.bbox[1].total_cmp(&b.bbox[1]))
            .then_with(|| a.bbox[0].total_cmp(&b.bbox[0]))
    });
}

/// Greedy non-maximum suppression, highest score first.
pub fn nms(detections: &[Detection], iou_threshold: f32) -> Vec<Detection> {
    let mut sorted = detections.to_vec();
    sorted.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let mut keep: Vec<Detection> = Vec::with_capacity(sorted.len());
    for candidate in sorted {
        if keep
            .iter()
            .all(|kept| compute_iou(&kept.bbox, &candidate.bbox) <= iou_threshold)
        {
            keep.push(candidate);
        }
    }
    keep
}

pub fn compute_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = (a[0] + a[2]).min(b[0] + b[2]);
    let y2 = (a[1] + a[3]).min(b[1] + b[3]);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let inter = (x2 - x1) * (y2 - y1);
    let union = a[2] * a[3] + b[2] * b[3] - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

// ArcFace reference eye positions on a 112x112 crop.
const REF_RIGHT_EYE: (f32, f32) = (38.2946, 51.6963);
const REF_LEFT_EYE: (f32, f32) = (73.5318, 51.5014);

/// Rotation + uniform scale + translation mapping source pixels to the
/// aligned crop.
#[derive(Debug, Clone, Copy)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Transform taking `src_eyes` onto `dst_eyes`.
    fn from_eyes(src_eyes: [(f32, f32); 2], dst_eyes: [(f32, f32); 2]) -> Option<Self> {
        let (sx, sy) = (src_eyes[1].0 - src_eyes[0].0, src_eyes[1].1 - src_eyes[0].1);
        let (dx, dy) = (dst_eyes[1].0 - dst_eyes[0].0, dst_eyes[1].1 - dst_eyes[0].1);
        let src_len2 = sx * sx + sy * sy;
        if src_len2 <= f32::EPSILON {
            return None;
        }
        // complex division dst / src gives scale * e^(i * angle)
        let a = (dx * sx + dy * sy) / src_len2;
        let b = (dy * sx - dx * sy) / src_len2;

        let src_mid = (
            (src_eyes[0].0 + src_eyes[1].0) / 2.0,
            (src_eyes[0].1 + src_eyes[1].1) / 2.0,
        );
        let dst_mid = (
            (dst_eyes[0].0 + dst_eyes[1].0) / 2.0,
            (dst_eyes[0].1 + dst_eyes[1].1) / 2.0,
        );
        Some(Self {
            a,
            b,
            tx: dst_mid.0 - (a * src_mid.0 - b * src_mid.1),
            ty: dst_mid.1 - (b * src_mid.0 + a * src_mid.1),
        })
    }

    /// Source position for an output pixel.
    fn invert(&self, x: f32, y: f32) -> (f32, f32) {
        let det = self.a * self.a + self.b * self.b;
        let (px, py) = (x - self.tx, y - self.ty);
        (
            (self.a * px + self.b * py) / det,
            (-self.b * px + self.a * py) / det,
        )
    }
}

fn bilinear(img: &RgbImage, x: f32, y: f32) -> Option<Rgb<u8>> {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 || x < 0.0 || y < 0.0 || x > (w - 1) as f32 || y > (h - 1) as f32 {
        return None;
    }
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);

    let p00 = img.get_pixel(x0, y0);
    let p10 = img.get_pixel(x1, y0);
    let p01 = img.get_pixel(x0, y1);
    let p11 = img.get_pixel(x1, y1);

    let mut out = [0u8; 3];
    for (c, v) in out.iter_mut().enumerate() {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        *v = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Some(Rgb(out))
}

/// Warp the face onto a `size`×`size` crop with the eyes at the ArcFace
/// reference positions. Pixels mapping outside the source stay black.
pub fn align_face(img: &DynamicImage, detection: &Detection, size: u32) -> Result<DynamicImage> {
    let lm = &detection.landmarks;
    let k = size as f32 / ALIGNED_SIZE as f32;
    let transform = Similarity::from_eyes(
        [(lm[0], lm[1]), (lm[2], lm[3])],
        [
            (REF_RIGHT_EYE.0 * k, REF_RIGHT_EYE.1 * k),
            (REF_LEFT_EYE.0 * k, REF_LEFT_EYE.1 * k),
        ],
    )
    .ok_or_else(|| anyhow::anyhow!("degenerate eye landmarks"))?;

    let src = img.to_rgb8();
    let aligned = RgbImage::from_fn(size, size, |x, y| {
        let (sx, sy) = transform.invert(x as f32, y as f32);
        bilinear(&src, sx, sy).unwrap_or(Rgb([0, 0, 0]))
    });

    Ok(DynamicImage::ImageRgb8(aligned))
}

/// Run SFace on an aligned crop and return the raw, unnormalized descriptor.
pub fn encode_face(session: &mut Session, face_img: &DynamicImage) -> Result<Vec<f32>> {
    let face = face_img
        .resize_exact(ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle)
        .to_rgb8();
    let input = Value::from_array(bgr_tensor(&face))?;
    let outputs = session.run(ort::inputs![input])?;
    let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;

    let len = match shape.len() {
        2 => shape[1] as usize,
        _ => data.len(),
    };
    if len > data.len() {
        anyhow::bail!("descriptor shape {:?} exceeds data length {}", &shape[..], data.len());
    }
    Ok(data[..len].to_vec())
}
