//! Multi-stride tensor decoding into face candidates.
//!
//! Export variants of the detection head disagree on how the four
//! box-regression values of an anchor are laid out. Every anchor is decoded
//! under each [`DecodeStrategy`] and the hypothesis with the best
//! [`geometry_score`] wins, so no second inference pass is needed.

use crate::geometry::geometry_score;
use crate::types::{FaceBox, Landmarks};

/// Detection head strides, finest first.
pub const STRIDES: [usize; 3] = [8, 16, 32];

/// Anchors scoring below this are never decoded. Every tuning threshold sits above it.
pub const DECODE_SCORE_FLOOR: f32 = 0.05;

/// A box may be at most this many input sizes wide or tall.
const MAX_BOX_EXTENT: f32 = 2.0;
/// Box centers must fall within [-0.5, 1.5] input sizes.
const CENTER_MARGIN: f32 = 0.5;
/// Smallest box side, in input pixels, worth scoring.
const MIN_BOX_SIDE: f32 = 1.0;
/// Geometry scores closer than this are treated as equal.
const GEOMETRY_TIE: f32 = 1e-4;

/// Mapping between letterboxed network input and original image pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    /// Compute the centered, aspect-preserving fit of `width × height` into a square input.
    pub fn fit(width: u32, height: u32, input_size: usize) -> Self {
        let scale_w = input_size as f32 / width as f32;
        let scale_h = input_size as f32 / height as f32;
        let scale = scale_w.min(scale_h);

        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();

        Self {
            scale,
            pad_x: ((input_size as f32 - new_w) / 2.0).floor(),
            pad_y: ((input_size as f32 - new_h) / 2.0).floor(),
        }
    }

    /// Resized image dimensions inside the letterbox.
    pub fn scaled_size(&self, width: u32, height: u32) -> (u32, u32) {
        (
            ((width as f32 * self.scale).round() as u32).max(1),
            ((height as f32 * self.scale).round() as u32).max(1),
        )
    }

    /// Map a letterboxed point back to original-image pixels.
    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }

    fn box_to_source(&self, b: &FaceBox) -> FaceBox {
        let (x, y) = self.to_source(b.x, b.y);
        FaceBox::new(x, y, b.width / self.scale, b.height / self.scale)
    }

    fn landmarks_to_source(&self, lm: &Landmarks) -> Landmarks {
        let mut out = [(0.0f32, 0.0f32); 5];
        for (dst, &(x, y)) in out.iter_mut().zip(lm.iter()) {
            *dst = self.to_source(x, y);
        }
        out
    }
}

/// One interpretation of an anchor's four box-regression values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeStrategy {
    /// `(x, y, w, h)` in input pixels; absolute landmarks.
    AbsoluteXywh,
    /// Left/top/right/bottom distances from the anchor point in input pixels.
    CenterLtrbPixels,
    /// Left/top/right/bottom distances from the anchor point in stride units.
    CenterLtrbStride,
    /// Center delta in cells plus log-space width/height in stride units.
    CenterDeltaExp,
}

impl DecodeStrategy {
    pub const ALL: [DecodeStrategy; 4] = [
        DecodeStrategy::AbsoluteXywh,
        DecodeStrategy::CenterLtrbPixels,
        DecodeStrategy::CenterLtrbStride,
        DecodeStrategy::CenterDeltaExp,
    ];

    /// Decode one anchor into letterbox space.
    fn apply(self, reg: &[f32], kps: &[f32], col: usize, row: usize, stride: usize) -> (FaceBox, Landmarks) {
        let s = stride as f32;
        let (ax, ay) = (col as f32 * s, row as f32 * s);

        let bbox = match self {
            DecodeStrategy::AbsoluteXywh => FaceBox::new(reg[0], reg[1], reg[2], reg[3]),
            DecodeStrategy::CenterLtrbPixels => {
                FaceBox::from_corners(ax - reg[0], ay - reg[1], ax + reg[2], ay + reg[3])
            }
            DecodeStrategy::CenterLtrbStride => {
                FaceBox::from_corners(ax - reg[0] * s, ay - reg[1] * s, ax + reg[2] * s, ay + reg[3] * s)
            }
            DecodeStrategy::CenterDeltaExp => {
                let cx = (col as f32 + reg[0]) * s;
                let cy = (row as f32 + reg[1]) * s;
                let w = reg[2].exp() * s;
                let h = reg[3].exp() * s;
                FaceBox::new(cx - w / 2.0, cy - h / 2.0, w, h)
            }
        };

        let mut landmarks = [(0.0f32, 0.0f32); 5];
        for (i, lm) in landmarks.iter_mut().enumerate() {
            let (kx, ky) = (kps[i * 2], kps[i * 2 + 1]);
            *lm = match self {
                DecodeStrategy::AbsoluteXywh => (kx, ky),
                DecodeStrategy::CenterLtrbPixels => (ax + kx, ay + ky),
                DecodeStrategy::CenterLtrbStride => (ax + kx * s, ay + ky * s),
                DecodeStrategy::CenterDeltaExp => ((kx + col as f32) * s, (ky + row as f32) * s),
            };
        }

        (bbox, landmarks)
    }
}

/// Pre-filter decode result. Coordinates are in original-image pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCandidate {
    pub bbox: FaceBox,
    pub landmarks: Landmarks,
    pub score: f32,
    pub geometry: f32,
    pub strategy: DecodeStrategy,
}

/// The four head tensors of one stride.
#[derive(Debug, Clone, Copy)]
pub struct StrideOutputs<'a> {
    pub stride: usize,
    pub cls: &'a [f32],
    pub obj: &'a [f32],
    pub bbox: &'a [f32],
    pub kps: &'a [f32],
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Cheap sanity check before a hypothesis is scored.
fn is_plausible(bbox: &FaceBox, landmarks: &Landmarks, input_size: usize) -> bool {
    let size = input_size as f32;
    if !bbox.is_finite() || landmarks.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
        return false;
    }
    if bbox.width < MIN_BOX_SIDE || bbox.height < MIN_BOX_SIDE {
        return false;
    }
    if bbox.width > MAX_BOX_EXTENT * size || bbox.height > MAX_BOX_EXTENT * size {
        return false;
    }
    let (cx, cy) = bbox.center();
    let (lo, hi) = (-CENTER_MARGIN * size, (1.0 + CENTER_MARGIN) * size);
    cx >= lo && cx <= hi && cy >= lo && cy <= hi
}

/// Whether `challenger` should replace `best` for the same anchor.
///
/// The pixel and stride LTRB readings are scaled copies of one shape and score
/// alike; on a tie the larger box wins.
fn outranks(challenger: &RawCandidate, best: &RawCandidate) -> bool {
    if (challenger.geometry - best.geometry).abs() <= GEOMETRY_TIE {
        challenger.geometry > 0.0 && challenger.bbox.area() > best.bbox.area()
    } else {
        challenger.geometry > best.geometry
    }
}

/// Decode every anchor of one stride, keeping the best hypothesis per anchor.
pub fn decode_stride(outputs: &StrideOutputs<'_>, input_size: usize, letterbox: &Letterbox) -> Vec<RawCandidate> {
    let stride = outputs.stride;
    let grid = input_size / stride;
    let cells = grid * grid;
    if cells == 0 {
        return Vec::new();
    }
    let anchors_per_cell = (outputs.cls.len() / cells).max(1);

    let mut candidates = Vec::new();

    for (idx, &cls) in outputs.cls.iter().enumerate() {
        let Some(&obj) = outputs.obj.get(idx) else {
            break;
        };
        let score = sigmoid(cls) * sigmoid(obj);
        if score.is_nan() || score < DECODE_SCORE_FLOOR {
            continue;
        }

        let (Some(reg), Some(kps)) = (
            outputs.bbox.get(idx * 4..idx * 4 + 4),
            outputs.kps.get(idx * 10..idx * 10 + 10),
        ) else {
            continue;
        };

        let cell = idx / anchors_per_cell;
        let (row, col) = (cell / grid, cell % grid);

        let mut best: Option<RawCandidate> = None;
        for strategy in DecodeStrategy::ALL {
            let (bbox, landmarks) = strategy.apply(reg, kps, col, row, stride);
            if !is_plausible(&bbox, &landmarks, input_size) {
                continue;
            }

            let bbox = letterbox.box_to_source(&bbox);
            let landmarks = letterbox.landmarks_to_source(&landmarks);
            let geometry = geometry_score(&bbox, &landmarks);

            let candidate = RawCandidate {
                bbox,
                landmarks,
                score,
                geometry,
                strategy,
            };
            if best.as_ref().map_or(true, |b| outranks(&candidate, b)) {
                best = Some(candidate);
            }
        }

        candidates.extend(best);
    }

    candidates
}

/// Decode all strides and merge the candidates.
pub fn decode_all(strides: &[StrideOutputs<'_>], input_size: usize, letterbox: &Letterbox) -> Vec<RawCandidate> {
    let candidates: Vec<RawCandidate> = strides
        .iter()
        .flat_map(|s| decode_stride(s, input_size, letterbox))
        .collect();
    tracing::debug!(count = candidates.len(), "decoded raw candidates");
    candidates
}
