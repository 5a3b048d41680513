//! Inference session seam.
//!
//! The detector and embedder talk to a model through [`InferenceSession`] so
//! the pipeline can run against ONNX Runtime in production and in-process
//! fakes in tests.

use ndarray::ArrayView4;
use ort::session::Session;
use ort::value::TensorRef;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

const ORT_INTRA_THREADS: usize = 2;

/// Named output tensors, flattened to `f32`.
pub type TensorMap = HashMap<String, Vec<f32>>;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    Failed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A loaded network that maps one NCHW input tensor to named outputs.
///
/// Implementations are not assumed to be reentrant; callers serialize access.
pub trait InferenceSession: Send {
    /// Output tensor names in model order.
    fn output_names(&self) -> Vec<String>;

    fn run(&mut self, input: ArrayView4<'_, f32>) -> Result<TensorMap, InferenceError>;
}

/// ONNX Runtime backed session.
pub struct OrtSession {
    session: Session,
    output_names: Vec<String>,
}

impl OrtSession {
    /// Load an ONNX model from a resolved local path.
    pub fn load(model_path: &Path) -> Result<Self, InferenceError> {
        if !model_path.exists() {
            return Err(InferenceError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(ORT_INTRA_THREADS)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded ONNX model"
        );

        Ok(Self {
            session,
            output_names,
        })
    }
}

impl InferenceSession for OrtSession {
    fn output_names(&self) -> Vec<String> {
        self.output_names.clone()
    }

    fn run(&mut self, input: ArrayView4<'_, f32>) -> Result<TensorMap, InferenceError> {
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input)?])?;

        let mut tensors = TensorMap::with_capacity(self.output_names.len());
        for (idx, name) in self.output_names.iter().enumerate() {
            let (_, data) = outputs[idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| InferenceError::Failed(format!("output {name}: {e}")))?;
            tensors.insert(name.clone(), data.to_vec());
        }

        Ok(tensors)
    }
}
