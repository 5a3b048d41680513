//! Face-likeness score for a box + landmark set.
//!
//! Used by the decoder to choose between competing box interpretations and by
//! the tuning filter to drop structurally impossible detections.

use crate::types::{FaceBox, Landmarks};

/// Fraction of box width/height a landmark may sit outside the box.
const BOX_TOLERANCE: f32 = 0.25;
const MIN_LANDMARKS_INSIDE: usize = 3;
/// Vertical slack for the nose, as a fraction of box height.
const NOSE_SLACK: f32 = 0.10;
/// Maximum eye-line tilt, as a fraction of box width.
const MAX_EYE_TILT: f32 = 0.30;
const EYE_DISTANCE_RANGE: (f32, f32) = (0.15, 0.85);
const MOUTH_TO_EYE_RANGE: (f32, f32) = (0.25, 1.6);
const EYE_LINE_RANGE: (f32, f32) = (0.05, 0.70);
const MOUTH_LINE_RANGE: (f32, f32) = (0.35, 1.05);

fn in_range(v: f32, (lo, hi): (f32, f32)) -> bool {
    v >= lo && v <= hi
}

/// Order a point pair left→right by x coordinate.
fn left_right(a: (f32, f32), b: (f32, f32)) -> ((f32, f32), (f32, f32)) {
    if a.0 <= b.0 {
        (a, b)
    } else {
        (b, a)
    }
}

/// Score how face-like a box + landmarks are, in [0, 1]. Returns 0 when implausible.
///
/// Invariant to the ordering of the eye and mouth pairs in the model output.
pub fn geometry_score(bbox: &FaceBox, landmarks: &Landmarks) -> f32 {
    if !bbox.is_finite() || bbox.width <= 0.0 || bbox.height <= 0.0 {
        return 0.0;
    }
    if landmarks.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
        return 0.0;
    }

    let (w, h) = (bbox.width, bbox.height);
    let (left_eye, right_eye) = left_right(landmarks[0], landmarks[1]);
    let nose = landmarks[2];
    let (left_mouth, right_mouth) = left_right(landmarks[3], landmarks[4]);

    let (min_x, max_x) = (bbox.x - BOX_TOLERANCE * w, bbox.x + w + BOX_TOLERANCE * w);
    let (min_y, max_y) = (bbox.y - BOX_TOLERANCE * h, bbox.y + h + BOX_TOLERANCE * h);
    let inside = landmarks
        .iter()
        .filter(|(x, y)| *x >= min_x && *x <= max_x && *y >= min_y && *y <= max_y)
        .count();
    if inside < MIN_LANDMARKS_INSIDE {
        return 0.0;
    }

    let eye_y = (left_eye.1 + right_eye.1) / 2.0;
    let mouth_y = (left_mouth.1 + right_mouth.1) / 2.0;
    if mouth_y <= eye_y {
        return 0.0;
    }
    let slack = NOSE_SLACK * h;
    if nose.1 < eye_y - slack || nose.1 > mouth_y + slack {
        return 0.0;
    }

    if (right_eye.1 - left_eye.1).abs() > MAX_EYE_TILT * w {
        return 0.0;
    }

    let eye_distance = right_eye.0 - left_eye.0;
    if !in_range(eye_distance / w, EYE_DISTANCE_RANGE) {
        return 0.0;
    }
    let mouth_width = right_mouth.0 - left_mouth.0;
    if !in_range(mouth_width / eye_distance, MOUTH_TO_EYE_RANGE) {
        return 0.0;
    }

    if !in_range((eye_y - bbox.y) / h, EYE_LINE_RANGE) || !in_range((mouth_y - bbox.y) / h, MOUTH_LINE_RANGE) {
        return 0.0;
    }

    let (cx, cy) = bbox.center();
    let centroid_x = landmarks.iter().map(|p| p.0).sum::<f32>() / 5.0;
    let centroid_y = landmarks.iter().map(|p| p.1).sum::<f32>() / 5.0;
    let d = (((centroid_x - cx) / w).powi(2) + ((centroid_y - cy) / h).powi(2)).sqrt();

    (1.0 - 2.0 * d).clamp(0.0, 1.0)
}
