//! Detection thresholds: fixed defaults, size-adaptive auto tuning, and
//! calibration against a reference image with a known face count.

use crate::decode::RawCandidate;
use crate::detector::select_faces;
use serde::{Deserialize, Serialize};

/// Faces smaller than this many source pixels are never kept.
pub const ABSOLUTE_MIN_FACE_PX: f32 = 8.0;

// Auto tuning interpolates between these short-side lengths.
const AUTO_SHORT_SIDE_MIN: f32 = 320.0;
const AUTO_SHORT_SIDE_MAX: f32 = 2048.0;

const CALIBRATION_SCORES: [f32; 7] = [0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9];
const CALIBRATION_GEOMETRY: [f32; 6] = [0.0, 0.1, 0.2, 0.3, 0.4, 0.5];
const CALIBRATION_SIZES: [f32; 4] = [0.005, 0.01, 0.02, 0.04];
const CALIBRATION_NMS: [f32; 3] = [0.5, 0.4, 0.3];

/// Post-decode filter and NMS parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    pub min_score: f32,
    pub geometry_threshold: f32,
    /// Minimum face side as a fraction of the image's short side.
    pub min_size_fraction: f32,
    /// Minimum face area as a fraction of the image area.
    pub min_area_fraction: f32,
    /// Minimum width / height.
    pub min_aspect: f32,
    /// Maximum width / height.
    pub max_aspect: f32,
    pub nms_iou: f32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            min_score: 0.6,
            geometry_threshold: 0.3,
            min_size_fraction: 0.02,
            min_area_fraction: 0.0002,
            min_aspect: 0.4,
            max_aspect: 1.6,
            nms_iou: 0.4,
        }
    }
}

impl Tuning {
    /// Thresholds scaled to the image's short side.
    ///
    /// Smaller images accept smaller relative faces and lower confidence.
    pub fn auto(width: u32, height: u32) -> Self {
        let short = width.min(height) as f32;
        let t = ((short - AUTO_SHORT_SIDE_MIN) / (AUTO_SHORT_SIDE_MAX - AUTO_SHORT_SIDE_MIN)).clamp(0.0, 1.0);
        let min_size_fraction = 0.015 + 0.015 * t;

        Self {
            min_score: 0.45 + 0.20 * t,
            geometry_threshold: 0.20 + 0.10 * t,
            min_size_fraction,
            min_area_fraction: 0.5 * min_size_fraction * min_size_fraction,
            min_aspect: 0.4,
            max_aspect: 1.6,
            nms_iou: 0.4,
        }
    }

    /// Whether a candidate survives every threshold except NMS.
    pub fn accepts(&self, candidate: &RawCandidate, width: u32, height: u32) -> bool {
        let b = &candidate.bbox;
        if candidate.score < self.min_score || candidate.geometry < self.geometry_threshold {
            return false;
        }

        let short = width.min(height) as f32;
        let min_side = ABSOLUTE_MIN_FACE_PX.max(self.min_size_fraction * short);
        if b.min_side() < min_side {
            return false;
        }

        let image_area = width as f32 * height as f32;
        if image_area <= 0.0 || b.area() / image_area < self.min_area_fraction {
            return false;
        }

        let aspect = b.aspect();
        aspect >= self.min_aspect && aspect <= self.max_aspect
    }

    /// Higher is less permissive. Only meaningful between grid points.
    fn strictness(&self) -> f32 {
        self.min_score + self.geometry_threshold + self.min_size_fraction * 10.0 - self.nms_iou
    }
}

/// Outcome of fitting a tuning to a reference image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub tuning: Tuning,
    /// Faces the chosen tuning keeps on the reference image.
    pub face_count: usize,
    /// Whether `face_count` equals the expected count.
    pub exact: bool,
}

/// Grid-search thresholds so the reference image yields `expected` faces.
///
/// Works on one set of raw candidates, so no further inference is needed.
/// Among equally close settings the strictest wins.
pub fn calibrate(candidates: &[RawCandidate], width: u32, height: u32, expected: usize) -> Calibration {
    let base = Tuning::default();
    let mut best: Option<(usize, Calibration)> = None;

    for &min_score in &CALIBRATION_SCORES {
        for &geometry_threshold in &CALIBRATION_GEOMETRY {
            for &min_size_fraction in &CALIBRATION_SIZES {
                for &nms_iou in &CALIBRATION_NMS {
                    let tuning = Tuning {
                        min_score,
                        geometry_threshold,
                        min_size_fraction,
                        min_area_fraction: 0.5 * min_size_fraction * min_size_fraction,
                        nms_iou,
                        ..base
                    };
                    let face_count = select_faces(candidates, &tuning, width, height).len();
                    let error = face_count.abs_diff(expected);

                    let better = match &best {
                        None => true,
                        Some((best_error, current)) => {
                            error < *best_error
                                || (error == *best_error && tuning.strictness() > current.tuning.strictness())
                        }
                    };
                    if better {
                        best = Some((
                            error,
                            Calibration {
                                tuning,
                                face_count,
                                exact: error == 0,
                            },
                        ));
                    }
                }
            }
        }
    }

    let calibration = best.map(|(_, c)| c).unwrap_or(Calibration {
        tuning: base,
        face_count: 0,
        exact: expected == 0,
    });

    tracing::info!(
        expected,
        found = calibration.face_count,
        exact = calibration.exact,
        tuning = ?calibration.tuning,
        "calibration finished"
    );

    calibration
}
