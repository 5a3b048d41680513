//! Multi-head face detector.
//!
//! Letterboxes an RGBA image into the network input, runs the session, decodes
//! every stride with [`crate::decode`], then filters by [`Tuning`] and applies
//! greedy NMS.

use crate::decode::{decode_all, Letterbox, RawCandidate, StrideOutputs, STRIDES};
use crate::session::{InferenceError, InferenceSession, OrtSession, TensorMap};
use crate::tuning::Tuning;
use crate::types::{ChannelOrder, DetectedFace};
use image::imageops::FilterType;
use image::RgbaImage;
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const DETECTOR_INPUT_SIZE: usize = 640;

/// Tensor name prefixes per stride: `cls_8`, `obj_8`, `bbox_8`, `kps_8`, ...
const HEAD_PREFIXES: [&str; 4] = ["cls", "obj", "bbox", "kps"];

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector output tensor missing: {0} (model/runtime mismatch)")]
    MissingOutput(String),
    #[error("invalid detector config: {0}")]
    InvalidConfig(String),
    #[error("image has zero width or height")]
    EmptyImage,
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// Network input layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Square input edge in pixels; must be divisible by every stride.
    pub input_size: usize,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub channel_order: ChannelOrder,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_size: DETECTOR_INPUT_SIZE,
            mean: [0.0; 3],
            std: [1.0; 3],
            channel_order: ChannelOrder::Bgr,
        }
    }
}

fn head_name(prefix: &str, stride: usize) -> String {
    format!("{prefix}_{stride}")
}

/// Check that every stride exposes its four named head tensors.
fn require_outputs(names: &[String]) -> Result<(), DetectorError> {
    for stride in STRIDES {
        for prefix in HEAD_PREFIXES {
            let target = head_name(prefix, stride);
            if !names.iter().any(|n| n == &target) {
                return Err(DetectorError::MissingOutput(target));
            }
        }
    }
    Ok(())
}

fn validate_config(config: &DetectorConfig) -> Result<(), DetectorError> {
    if config.input_size == 0 || STRIDES.iter().any(|s| config.input_size % s != 0) {
        return Err(DetectorError::InvalidConfig(format!(
            "input_size {} is not a positive multiple of {:?}",
            config.input_size, STRIDES
        )));
    }
    if config.std.iter().any(|s| !s.is_finite() || *s == 0.0) || config.mean.iter().any(|m| !m.is_finite()) {
        return Err(DetectorError::InvalidConfig(format!(
            "mean {:?} / std {:?} must be finite with non-zero std",
            config.mean, config.std
        )));
    }
    Ok(())
}

fn head<'a>(tensors: &'a TensorMap, prefix: &str, stride: usize) -> Result<&'a [f32], DetectorError> {
    let name = head_name(prefix, stride);
    match tensors.get(&name) {
        Some(data) => Ok(data.as_slice()),
        None => Err(DetectorError::MissingOutput(name)),
    }
}

fn stride_outputs(tensors: &TensorMap, stride: usize) -> Result<StrideOutputs<'_>, DetectorError> {
    Ok(StrideOutputs {
        stride,
        cls: head(tensors, "cls", stride)?,
        obj: head(tensors, "obj", stride)?,
        bbox: head(tensors, "bbox", stride)?,
        kps: head(tensors, "kps", stride)?,
    })
}

/// Face detector over an [`InferenceSession`].
pub struct FaceDetector {
    session: Box<dyn InferenceSession>,
    config: DetectorConfig,
}

impl FaceDetector {
    /// Wrap a loaded session, failing fast if its outputs do not match the head layout.
    pub fn new(session: Box<dyn InferenceSession>, config: DetectorConfig) -> Result<Self, DetectorError> {
        validate_config(&config)?;
        let names = session.output_names();
        require_outputs(&names)?;
        tracing::debug!(outputs = ?names, input_size = config.input_size, "detector output mapping verified");
        Ok(Self { session, config })
    }

    /// Load the detector ONNX model from a resolved local path.
    pub fn load(model_path: &Path, config: DetectorConfig) -> Result<Self, DetectorError> {
        let session = OrtSession::load(model_path)?;
        Self::new(Box::new(session), config)
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Run inference and decode every stride without applying any thresholds.
    pub fn decode_raw(&mut self, image: &RgbaImage) -> Result<Vec<RawCandidate>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectorError::EmptyImage);
        }

        let (input, letterbox) = self.preprocess(image);
        let tensors = self.session.run(input.view())?;

        let strides = STRIDES
            .iter()
            .map(|&stride| stride_outputs(&tensors, stride))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(decode_all(&strides, self.config.input_size, &letterbox))
    }

    /// Detect faces, returning them sorted by confidence, highest first.
    pub fn detect(&mut self, image: &RgbaImage, tuning: &Tuning) -> Result<Vec<DetectedFace>, DetectorError> {
        let candidates = self.decode_raw(image)?;
        let faces = select_faces(&candidates, tuning, image.width(), image.height());
        tracing::debug!(
            candidates = candidates.len(),
            faces = faces.len(),
            width = image.width(),
            height = image.height(),
            "detection finished"
        );
        Ok(faces)
    }

    /// Letterbox an RGBA image into a normalized NCHW tensor.
    ///
    /// The image is resized with a triangle filter, centered, and padded with
    /// black.
    fn preprocess(&self, image: &RgbaImage) -> (Array4<f32>, Letterbox) {
        let size = self.config.input_size;
        let letterbox = Letterbox::fit(image.width(), image.height(), size);
        let (new_w, new_h) = letterbox.scaled_size(image.width(), image.height());
        let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);

        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        let (mean, std) = (self.config.mean, self.config.std);
        for c in 0..3 {
            let black = (0.0 - mean[c]) / std[c];
            tensor.slice_mut(ndarray::s![0, c, .., ..]).fill(black);
        }

        let pad_x = letterbox.pad_x as usize;
        let pad_y = letterbox.pad_y as usize;
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (tx, ty) = (x as usize + pad_x, y as usize + pad_y);
            if tx >= size || ty >= size {
                continue;
            }
            for c in 0..3 {
                let v = pixel.0[self.config.channel_order.source_channel(c)] as f32;
                tensor[[0, c, ty, tx]] = (v - mean[c]) / std[c];
            }
        }

        (tensor, letterbox)
    }
}

/// Apply tuning thresholds and NMS to raw candidates.
pub fn select_faces(candidates: &[RawCandidate], tuning: &Tuning, width: u32, height: u32) -> Vec<DetectedFace> {
    let kept: Vec<DetectedFace> = candidates
        .iter()
        .filter(|c| tuning.accepts(c, width, height))
        .map(|c| DetectedFace {
            bbox: c.bbox,
            landmarks: c.landmarks,
            confidence: c.score,
        })
        .collect();

    nms(kept, tuning.nms_iou)
}

/// Greedy Non-Maximum Suppression, highest confidence first.
pub fn nms(mut detections: Vec<DetectedFace>, iou_threshold: f32) -> Vec<DetectedFace> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<DetectedFace> = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..detections.len() {
            if !suppressed[j] && detections[i].bbox.iou(&detections[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
        keep.push(detections[i].clone());
    }

    keep
}
