//! ArcFace-style face embedder.
//!
//! Aligns each detected face to the canonical 112×112 crop, runs the
//! embedding network and L2-normalizes the result.

use crate::alignment::{self, AlignmentError, ALIGNED_SIZE};
use crate::session::{InferenceError, InferenceSession, OrtSession};
use crate::types::{ChannelOrder, DetectedFace, Embedding};
use image::imageops::FilterType;
use image::RgbaImage;
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, not 128.0
const ARCFACE_EMBEDDING_DIM: usize = 512;

/// Below this norm the raw vector is returned unnormalized.
const MIN_EMBEDDING_NORM: f32 = 1e-6;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("embedder model exposes no output tensor")]
    NoOutput,
    #[error("expected {expected}-dim embedding, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error(transparent)]
    Alignment(#[from] AlignmentError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderConfig {
    /// Square network input edge; aligned crops are resized when it differs from 112.
    pub input_size: u32,
    pub mean: f32,
    pub std: f32,
    pub channel_order: ChannelOrder,
    /// Reject outputs of any other length. `None` accepts whatever the model emits.
    pub expected_dim: Option<usize>,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            input_size: ALIGNED_SIZE,
            mean: ARCFACE_MEAN,
            std: ARCFACE_STD,
            channel_order: ChannelOrder::Rgb,
            expected_dim: Some(ARCFACE_EMBEDDING_DIM),
        }
    }
}

/// Embedding extractor over an [`InferenceSession`].
pub struct FaceEmbedder {
    session: Box<dyn InferenceSession>,
    config: EmbedderConfig,
    model_id: String,
    output_name: String,
}

impl FaceEmbedder {
    pub fn new(
        session: Box<dyn InferenceSession>,
        config: EmbedderConfig,
        model_id: impl Into<String>,
    ) -> Result<Self, RecognizerError> {
        let output_name = session.output_names().into_iter().next().ok_or(RecognizerError::NoOutput)?;
        Ok(Self {
            session,
            config,
            model_id: model_id.into(),
            output_name,
        })
    }

    /// Load the embedder ONNX model from a resolved local path.
    pub fn load(model_path: &Path, config: EmbedderConfig, model_id: &str) -> Result<Self, RecognizerError> {
        let session = OrtSession::load(model_path)?;
        tracing::info!(path = %model_path.display(), model_id, "loaded embedder model");
        Self::new(Box::new(session), config, model_id)
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Extract an embedding for one detected face in `image`.
    pub fn extract(&mut self, image: &RgbaImage, face: &DetectedFace) -> Result<Embedding, RecognizerError> {
        let aligned = alignment::align_face(image, &face.landmarks)?;
        let input = self.preprocess(&aligned);

        let mut tensors = self.session.run(input.view())?;
        let raw = tensors.remove(&self.output_name).ok_or(RecognizerError::NoOutput)?;

        if let Some(expected) = self.config.expected_dim {
            if raw.len() != expected {
                return Err(RecognizerError::DimensionMismatch {
                    expected,
                    actual: raw.len(),
                });
            }
        }

        Ok(Embedding::new(l2_normalize(raw), self.model_id.clone()))
    }

    /// Convert an aligned RGBA crop into a normalized NCHW tensor.
    fn preprocess(&self, aligned: &RgbaImage) -> Array4<f32> {
        let size = self.config.input_size;
        let resized;
        let crop = if aligned.dimensions() == (size, size) {
            aligned
        } else {
            resized = image::imageops::resize(aligned, size, size, FilterType::Triangle);
            &resized
        };

        let size = size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in crop.enumerate_pixels() {
            for c in 0..3 {
                let v = pixel.0[self.config.channel_order.source_channel(c)] as f32;
                tensor[[0, c, y as usize, x as usize]] = (v - self.config.mean) / self.config.std;
            }
        }
        tensor
    }
}

/// Scale `raw` to unit length. Near-zero vectors come back untouched.
pub fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm.is_nan() || norm < MIN_EMBEDDING_NORM {
        tracing::warn!(norm, "embedding norm near zero, returning raw vector");
        return raw;
    }
    raw.into_iter().map(|x| x / norm).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::alignment::REFERENCE_LANDMARKS_112;
    use crate::session::TensorMap;
    use crate::types::FaceBox;
    use image::Rgba;
    use ndarray::ArrayView4;

    /// Fake embedder: the vector is the per-channel mean of the input shifted
    /// away from zero, padded to `dim`.
    pub(crate) struct FakeEmbedderSession {
        pub dim: usize,
        pub zero: bool,
    }

    impl FakeEmbedderSession {
        pub(crate) fn new(dim: usize) -> Self {
            Self { dim, zero: false }
        }
    }

    impl InferenceSession for FakeEmbedderSession {
        fn output_names(&self) -> Vec<String> {
            vec!["embedding".to_string()]
        }

        fn run(&mut self, input: ArrayView4<'_, f32>) -> Result<TensorMap, InferenceError> {
            let mut values = vec![0.0f32; self.dim];
            if !self.zero {
                let plane = (input.shape()[2] * input.shape()[3]) as f32;
                for c in 0..3.min(self.dim) {
                    let sum: f32 = input.slice(ndarray::s![0, c, .., ..]).iter().sum();
                    values[c] = sum / plane + 2.0;
                }
            }
            let mut tensors = TensorMap::new();
            tensors.insert("embedding".to_string(), values);
            Ok(tensors)
        }
    }

    pub(crate) fn face_at_reference() -> DetectedFace {
        DetectedFace {
            bbox: FaceBox::new(20.0, 30.0, 72.0, 80.0),
            landmarks: REFERENCE_LANDMARKS_112,
            confidence: 0.95,
        }
    }

    fn embedder(dim: usize, config: EmbedderConfig) -> FaceEmbedder {
        FaceEmbedder::new(Box::new(FakeEmbedderSession::new(dim)), config, "fake").unwrap()
    }

    #[test]
    fn test_extract_is_unit_length() {
        let mut e = embedder(512, EmbedderConfig::default());
        let image = RgbaImage::from_pixel(200, 200, Rgba([200, 40, 90, 255]));
        let emb = e.extract(&image, &face_at_reference()).unwrap();
        assert_eq!(emb.values.len(), 512);
        assert_eq!(emb.model_id, "fake");
        assert!((emb.norm() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut e = embedder(128, EmbedderConfig::default());
        let image = RgbaImage::from_pixel(200, 200, Rgba([10, 10, 10, 255]));
        let err = e.extract(&image, &face_at_reference()).unwrap_err();
        assert!(matches!(err, RecognizerError::DimensionMismatch { expected: 512, actual: 128 }));
    }

    #[test]
    fn test_dimension_check_optional() {
        let config = EmbedderConfig {
            expected_dim: None,
            ..EmbedderConfig::default()
        };
        let mut e = embedder(128, config);
        let image = RgbaImage::from_pixel(200, 200, Rgba([10, 10, 10, 255]));
        assert_eq!(e.extract(&image, &face_at_reference()).unwrap().values.len(), 128);
    }

    #[test]
    fn test_degenerate_landmarks_fail_alignment() {
        let mut e = embedder(512, EmbedderConfig::default());
        let image = RgbaImage::from_pixel(200, 200, Rgba([10, 10, 10, 255]));
        let mut face = face_at_reference();
        face.landmarks = [(50.0, 50.0); 5];
        let err = e.extract(&image, &face).unwrap_err();
        assert!(matches!(err, RecognizerError::Alignment(AlignmentError::Singular { .. })));
    }

    #[test]
    fn test_zero_vector_returned_raw() {
        let mut session = FakeEmbedderSession::new(8);
        session.zero = true;
        let config = EmbedderConfig {
            expected_dim: Some(8),
            ..EmbedderConfig::default()
        };
        let mut e = FaceEmbedder::new(Box::new(session), config, "fake").unwrap();
        let image = RgbaImage::from_pixel(200, 200, Rgba([10, 10, 10, 255]));
        let emb = e.extract(&image, &face_at_reference()).unwrap();
        assert!(emb.values.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_no_output_rejected() {
        struct Silent;
        impl InferenceSession for Silent {
            fn output_names(&self) -> Vec<String> {
                Vec::new()
            }
            fn run(&mut self, _input: ArrayView4<'_, f32>) -> Result<TensorMap, InferenceError> {
                Ok(TensorMap::new())
            }
        }
        let err = FaceEmbedder::new(Box::new(Silent), EmbedderConfig::default(), "x").err();
        assert!(matches!(err, Some(RecognizerError::NoOutput)));
    }

    #[test]
    fn test_preprocess_normalization_and_order() {
        let e = embedder(512, EmbedderConfig::default());
        let crop = RgbaImage::from_pixel(112, 112, Rgba([255, 0, 128, 255]));
        let tensor = e.preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        assert!((tensor[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 5, 5]] - (128.0 - 127.5) / 127.5).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_resizes_to_input_size() {
        let config = EmbedderConfig {
            input_size: 96,
            ..EmbedderConfig::default()
        };
        let e = embedder(512, config);
        let crop = RgbaImage::from_pixel(112, 112, Rgba([100, 100, 100, 255]));
        assert_eq!(e.preprocess(&crop).shape(), &[1, 3, 96, 96]);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }
}
