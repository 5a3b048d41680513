//! Face alignment via 4-DOF similarity transform.
//!
//! Aligns detected faces to a canonical 112×112 position using the five
//! ArcFace reference landmarks and least-squares estimation.

use crate::types::Landmarks;
use image::{Rgba, RgbaImage};
use thiserror::Error;

/// ArcFace reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS_112: Landmarks = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Pivots below this mean the landmarks do not determine a transform.
const SINGULAR_EPSILON: f64 = 1e-9;

const OUT_OF_BOUNDS: Rgba<u8> = Rgba([0, 0, 0, 255]);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignmentError {
    #[error("landmarks are degenerate; similarity transform is singular (pivot {pivot:e})")]
    Singular { pivot: f64 },
    #[error("landmarks contain non-finite values")]
    NonFinite,
}

/// Similarity transform mapping source points to destination points:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl SimilarityTransform {
    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// Uniform scale factor of the transform.
    pub fn scale(&self) -> f32 {
        (self.a * self.a + self.b * self.b).sqrt()
    }
}

/// Estimate the similarity transform from `src` landmarks to `dst` landmarks
/// using least squares over all ten coordinates.
///
/// Both point sets are centered before the 4×4 normal equations are built so
/// that large pixel coordinates do not swamp the pivots.
pub fn estimate_similarity_transform(
    src: &Landmarks,
    dst: &Landmarks,
) -> Result<SimilarityTransform, AlignmentError> {
    if src.iter().chain(dst.iter()).any(|(x, y)| !x.is_finite() || !y.is_finite()) {
        return Err(AlignmentError::NonFinite);
    }

    let centroid = |pts: &Landmarks| -> (f64, f64) {
        let n = pts.len() as f64;
        (
            pts.iter().map(|p| p.0 as f64).sum::<f64>() / n,
            pts.iter().map(|p| p.1 as f64).sum::<f64>() / n,
        )
    };
    let (smx, smy) = centroid(src);
    let (dmx, dmy) = centroid(dst);

    // Overdetermined system A * [a, b, tx, ty]^T = B, per point pair:
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [[0.0f64; 4]; 4];
    let mut atb = [0.0f64; 4];

    for (s, d) in src.iter().zip(dst.iter()) {
        let (sx, sy) = (s.0 as f64 - smx, s.1 as f64 - smy);
        let (dx, dy) = (d.0 as f64 - dmx, d.1 as f64 - dmy);

        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];

        for j in 0..4 {
            for k in 0..4 {
                ata[j][k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let [a, b, tx_c, ty_c] = solve_4x4(ata, atb)?;

    // Undo the centering: dst = M (src - smean) + t_c + dmean
    let tx = tx_c + dmx - (a * smx - b * smy);
    let ty = ty_c + dmy - (b * smx + a * smy);

    Ok(SimilarityTransform {
        a: a as f32,
        b: b as f32,
        tx: tx as f32,
        ty: ty as f32,
    })
}

/// Solve a 4×4 linear system via Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: [[f64; 4]; 4], atb: [f64; 4]) -> Result<[f64; 4], AlignmentError> {
    // Augmented matrix [A | b] as 4x5
    let mut m = [[0.0f64; 5]; 4];
    for i in 0..4 {
        m[i][..4].copy_from_slice(&ata[i]);
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let mut max_row = col;
        for row in (col + 1)..4 {
            if m[row][col].abs() > m[max_row][col].abs() {
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < SINGULAR_EPSILON {
            return Err(AlignmentError::Singular { pivot });
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    // Back substitution
    let mut x = [0.0f64; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    Ok(x)
}

/// Warp `image` into an `out_size × out_size` crop through `transform`.
///
/// Each output pixel is mapped back through the inverse transform and
/// bilinearly sampled. Out-of-bounds samples are opaque black.
pub fn warp_affine(image: &RgbaImage, transform: &SimilarityTransform, out_size: u32) -> RgbaImage {
    let (a, b, tx, ty) = (transform.a, transform.b, transform.tx, transform.ty);

    // Invert the 2x2 part: M = [[a, -b], [b, a]], det = a^2 + b^2
    let det = a * a + b * b;
    if det <= f32::EPSILON {
        return RgbaImage::from_pixel(out_size, out_size, OUT_OF_BOUNDS);
    }
    let ia = a / det;
    let ib = b / det;

    let (width, height) = (image.width() as i64, image.height() as i64);
    let sample = |x: i64, y: i64| -> [f32; 4] {
        let p = if x >= 0 && x < width && y >= 0 && y < height {
            image.get_pixel(x as u32, y as u32)
        } else {
            &OUT_OF_BOUNDS
        };
        [p.0[0] as f32, p.0[1] as f32, p.0[2] as f32, p.0[3] as f32]
    };

    RgbaImage::from_fn(out_size, out_size, |ox, oy| {
        // src = M_inv * (dst - t)
        let dx = ox as f32 - tx;
        let dy = oy as f32 - ty;
        let sx = ia * dx + ib * dy;
        let sy = -ib * dx + ia * dy;

        let x0 = sx.floor() as i64;
        let y0 = sy.floor() as i64;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let tl = sample(x0, y0);
        let tr = sample(x0 + 1, y0);
        let bl = sample(x0, y0 + 1);
        let br = sample(x0 + 1, y0 + 1);

        let mut out = [0u8; 4];
        for c in 0..4 {
            let v = tl[c] * (1.0 - fx) * (1.0 - fy) + tr[c] * fx * (1.0 - fy) + bl[c] * (1.0 - fx) * fy + br[c] * fx * fy;
            out[c] = v.round().clamp(0.0, 255.0) as u8;
        }
        Rgba(out)
    })
}

/// Align a detected face to a canonical 112×112 RGBA crop.
pub fn align_face(image: &RgbaImage, landmarks: &Landmarks) -> Result<RgbaImage, AlignmentError> {
    let transform = estimate_similarity_transform(landmarks, &REFERENCE_LANDMARKS_112)?;
    Ok(warp_affine(image, &transform, ALIGNED_SIZE))
}
