//! Face and identity quality scores.

use crate::types::FaceBox;

/// Box side at which the size term saturates.
const FULL_QUALITY_SIDE_PX: f32 = 112.0;
const CONFIDENCE_WEIGHT: f32 = 0.6;
const SIZE_WEIGHT: f32 = 0.4;

const TOP_FACES: usize = 5;
const MAX_COUNT_BONUS: f32 = 0.1;

/// Quality of a single face in [0, 1], monotone in confidence and box size.
pub fn face_quality(confidence: f32, bbox: &FaceBox) -> f32 {
    let confidence = if confidence.is_finite() { confidence.clamp(0.0, 1.0) } else { 0.0 };
    let side = bbox.min_side();
    let size = if side.is_finite() { (side / FULL_QUALITY_SIDE_PX).clamp(0.0, 1.0) } else { 0.0 };
    CONFIDENCE_WEIGHT * confidence + SIZE_WEIGHT * size
}

/// Aggregate quality of an identity from its face qualities.
///
/// Mean of the best five faces plus a small bonus that grows with the face count.
pub fn identity_quality(face_qualities: &[f32]) -> f32 {
    if face_qualities.is_empty() {
        return 0.0;
    }

    let mut sorted = face_qualities.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let top = &sorted[..sorted.len().min(TOP_FACES)];
    let mean = top.iter().sum::<f32>() / top.len() as f32;

    let bonus = ((1.0 + face_qualities.len() as f32).log10() / 20.0).min(MAX_COUNT_BONUS);
    mean + bonus
}
