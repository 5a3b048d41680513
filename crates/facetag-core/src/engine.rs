//! Engine context.
//!
//! Owns the model configuration and loads the detector and embedder lazily,
//! exactly once, on first use. Each loaded model sits behind its own mutex so
//! concurrent callers serialize per session.

use crate::detector::{DetectorConfig, DetectorError, FaceDetector};
use crate::matcher::{FaceMatch, FaceObservation, IdentityMatcher, MatcherConfig, MatcherError};
use crate::recognizer::{EmbedderConfig, FaceEmbedder, RecognizerError};
use crate::scan::CancelToken;
use crate::session::{InferenceError, InferenceSession, OrtSession};
use crate::store::{IdentityMutation, IdentityStore};
use crate::tuning::{calibrate, Calibration, Tuning};
use crate::types::{DetectedFace, Embedding};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use thiserror::Error;

const DEFAULT_DETECTOR_FILE: &str = "det_10g.onnx";
const DEFAULT_DETECTOR_ID: &str = "det_10g";
const DEFAULT_EMBEDDER_FILE: &str = "w600k_r50.onnx";
const DEFAULT_EMBEDDER_ID: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model misconfigured: {0}")]
    Misconfigured(String),
    #[error("model unavailable: {0}")]
    Unavailable(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Recognizer(#[from] RecognizerError),
    #[error(transparent)]
    Matcher(#[from] MatcherError),
}

/// A model file and the stable id recorded alongside its outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub path: PathBuf,
    pub model_id: String,
}

impl ModelSpec {
    pub fn new(path: impl Into<PathBuf>, model_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            model_id: model_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub detector_model: ModelSpec,
    pub embedder_model: ModelSpec,
    pub detector: DetectorConfig,
    pub embedder: EmbedderConfig,
    pub matcher: MatcherConfig,
}

impl EngineConfig {
    /// Default model file names resolved against `dir`.
    pub fn with_model_dir(dir: &Path) -> Self {
        Self {
            detector_model: ModelSpec::new(dir.join(DEFAULT_DETECTOR_FILE), DEFAULT_DETECTOR_ID),
            embedder_model: ModelSpec::new(dir.join(DEFAULT_EMBEDDER_FILE), DEFAULT_EMBEDDER_ID),
            detector: DetectorConfig::default(),
            embedder: EmbedderConfig::default(),
            matcher: MatcherConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::with_model_dir(Path::new("models"))
    }
}

/// Opens an inference session for a model spec.
pub type SessionFactory = Box<dyn Fn(&ModelSpec) -> Result<Box<dyn InferenceSession>, InferenceError> + Send + Sync>;

fn ort_factory() -> SessionFactory {
    Box::new(|spec: &ModelSpec| {
        let session = OrtSession::load(&spec.path)?;
        Ok(Box::new(session) as Box<dyn InferenceSession>)
    })
}

enum ModelState<T> {
    Ready(Mutex<T>),
    /// File missing or runtime failure: inference yields empty results.
    Unavailable(String),
    /// Model loaded but its outputs do not fit: every call fails.
    Misconfigured(String),
}

impl<T> ModelState<T> {
    fn status(&self) -> LoadStatus {
        match self {
            ModelState::Ready(_) => LoadStatus::Ready,
            ModelState::Unavailable(reason) => LoadStatus::Unavailable(reason.clone()),
            ModelState::Misconfigured(reason) => LoadStatus::Misconfigured(reason.clone()),
        }
    }
}

fn lock<T>(model: &Mutex<T>) -> MutexGuard<'_, T> {
    model.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum LoadStatus {
    Ready,
    Unavailable(String),
    Misconfigured(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub detector: LoadStatus,
    pub embedder: LoadStatus,
}

/// Outcome of running one image through detect, embed and match.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImageReport {
    pub media_id: String,
    pub faces: Vec<DetectedFace>,
    pub matches: Vec<FaceMatch>,
    pub mutations: Vec<IdentityMutation>,
    /// Faces whose alignment or embedding failed.
    pub skipped_faces: usize,
}

pub struct FaceEngine {
    config: EngineConfig,
    factory: SessionFactory,
    detector: OnceLock<ModelState<FaceDetector>>,
    embedder: OnceLock<ModelState<FaceEmbedder>>,
}

impl FaceEngine {
    /// Engine backed by ONNX Runtime sessions.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_session_factory(config, ort_factory())
    }

    pub fn with_session_factory(config: EngineConfig, factory: SessionFactory) -> Self {
        Self {
            config,
            factory,
            detector: OnceLock::new(),
            embedder: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn detector_model_id(&self) -> &str {
        &self.config.detector_model.model_id
    }

    pub fn embedder_model_id(&self) -> &str {
        &self.config.embedder_model.model_id
    }

    fn detector(&self) -> &ModelState<FaceDetector> {
        self.detector.get_or_init(|| {
            let spec = &self.config.detector_model;
            let session = match (self.factory)(spec) {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(path = %spec.path.display(), error = %e, "detector unavailable");
                    return ModelState::Unavailable(e.to_string());
                }
            };
            match FaceDetector::new(session, self.config.detector.clone()) {
                Ok(detector) => {
                    tracing::info!(path = %spec.path.display(), model_id = %spec.model_id, "detector ready");
                    ModelState::Ready(Mutex::new(detector))
                }
                Err(e @ (DetectorError::MissingOutput(_) | DetectorError::InvalidConfig(_))) => {
                    tracing::error!(path = %spec.path.display(), error = %e, "detector misconfigured");
                    ModelState::Misconfigured(e.to_string())
                }
                Err(e) => {
                    tracing::warn!(path = %spec.path.display(), error = %e, "detector unavailable");
                    ModelState::Unavailable(e.to_string())
                }
            }
        })
    }

    fn embedder(&self) -> &ModelState<FaceEmbedder> {
        self.embedder.get_or_init(|| {
            let spec = &self.config.embedder_model;
            let session = match (self.factory)(spec) {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(path = %spec.path.display(), error = %e, "embedder unavailable");
                    return ModelState::Unavailable(e.to_string());
                }
            };
            match FaceEmbedder::new(session, self.config.embedder.clone(), spec.model_id.clone()) {
                Ok(embedder) => {
                    tracing::info!(path = %spec.path.display(), model_id = %spec.model_id, "embedder ready");
                    ModelState::Ready(Mutex::new(embedder))
                }
                Err(e) => {
                    tracing::error!(path = %spec.path.display(), error = %e, "embedder misconfigured");
                    ModelState::Misconfigured(e.to_string())
                }
            }
        })
    }

    /// Load both models if needed and report whether both are usable.
    pub fn is_loaded(&self) -> bool {
        matches!(self.detector(), ModelState::Ready(_)) && matches!(self.embedder(), ModelState::Ready(_))
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            detector: self.detector().status(),
            embedder: self.embedder().status(),
        }
    }

    /// Detect faces. `None` tuning means auto tuning for the image size.
    ///
    /// An unavailable detector yields no faces; a misconfigured one is an error.
    pub fn detect(&self, image: &RgbaImage, tuning: Option<&Tuning>) -> Result<Vec<DetectedFace>, EngineError> {
        match self.detector() {
            ModelState::Ready(detector) => {
                let tuning = tuning
                    .copied()
                    .unwrap_or_else(|| Tuning::auto(image.width(), image.height()));
                Ok(lock(detector).detect(image, &tuning)?)
            }
            ModelState::Unavailable(reason) => {
                tracing::debug!(reason = %reason, "detector unavailable, returning no faces");
                Ok(Vec::new())
            }
            ModelState::Misconfigured(reason) => Err(EngineError::Misconfigured(reason.clone())),
        }
    }

    /// Fit a tuning so `image` yields `expected` faces.
    pub fn calibrate(&self, image: &RgbaImage, expected: usize) -> Result<Calibration, EngineError> {
        match self.detector() {
            ModelState::Ready(detector) => {
                let candidates = lock(detector).decode_raw(image)?;
                Ok(calibrate(&candidates, image.width(), image.height(), expected))
            }
            ModelState::Unavailable(reason) => Err(EngineError::Unavailable(reason.clone())),
            ModelState::Misconfigured(reason) => Err(EngineError::Misconfigured(reason.clone())),
        }
    }

    /// Embed one detected face. `None` when the embedder is unavailable.
    pub fn embed(&self, image: &RgbaImage, face: &DetectedFace) -> Result<Option<Embedding>, EngineError> {
        match self.embedder() {
            ModelState::Ready(embedder) => Ok(Some(lock(embedder).extract(image, face)?)),
            ModelState::Unavailable(_) => Ok(None),
            ModelState::Misconfigured(reason) => Err(EngineError::Misconfigured(reason.clone())),
        }
    }

    /// Detect, embed and match every face of one image.
    ///
    /// Faces that fail alignment or embedding are skipped. The matcher is only
    /// touched when both models are ready, so a missing model never clears
    /// previously stored faces. A misconfigured model fails the whole image.
    pub fn process_image<S: IdentityStore>(
        &self,
        media_id: &str,
        image: &RgbaImage,
        tuning: Option<&Tuning>,
        matcher: &IdentityMatcher<S>,
        cancel: &CancelToken,
    ) -> Result<ImageReport, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let faces = self.detect(image, tuning)?;
        let mut report = ImageReport {
            media_id: media_id.to_string(),
            ..ImageReport::default()
        };

        match self.embedder() {
            ModelState::Ready(_) => {}
            ModelState::Misconfigured(reason) => return Err(EngineError::Misconfigured(reason.clone())),
            ModelState::Unavailable(_) => {
                tracing::debug!(media_id, faces = faces.len(), "embedder unavailable, skipping identity matching");
                report.faces = faces;
                return Ok(report);
            }
        }
        if !matches!(self.detector(), ModelState::Ready(_)) {
            tracing::debug!(media_id, "detector unavailable, skipping identity matching");
            return Ok(report);
        }

        let mut observations = Vec::with_capacity(faces.len());
        for (index, face) in faces.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match self.embed(image, face) {
                Ok(Some(embedding)) => observations.push(FaceObservation {
                    face_index: index as u32,
                    face: face.clone(),
                    embedding,
                }),
                Ok(None) => report.skipped_faces += 1,
                Err(EngineError::Recognizer(e)) => {
                    tracing::warn!(media_id, face = index, error = %e, "skipping face");
                    report.skipped_faces += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let assignment = matcher.assign_faces(media_id, self.detector_model_id(), &observations)?;
        tracing::debug!(
            media_id,
            faces = faces.len(),
            matched = assignment.matches.len(),
            skipped = report.skipped_faces,
            "image processed"
        );

        report.faces = faces;
        report.matches = assignment.matches;
        report.mutations = assignment.mutations;
        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::detector::tests::FakeDetectorSession;
    use crate::recognizer::tests::FakeEmbedderSession;
    use crate::store::MemoryStore;
    use image::Rgba;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    pub(crate) fn test_config() -> EngineConfig {
        EngineConfig {
            detector_model: ModelSpec::new("det.onnx", "det"),
            embedder_model: ModelSpec::new("emb.onnx", "emb"),
            ..EngineConfig::default()
        }
    }

    pub(crate) fn fake_factory(loads: Arc<AtomicUsize>) -> SessionFactory {
        Box::new(move |spec: &ModelSpec| {
            loads.fetch_add(1, Ordering::SeqCst);
            let session: Box<dyn InferenceSession> = if spec.model_id == "det" {
                Box::new(FakeDetectorSession::new())
            } else {
                Box::new(FakeEmbedderSession::new(512))
            };
            Ok(session)
        })
    }

    pub(crate) fn fake_engine() -> FaceEngine {
        FaceEngine::with_session_factory(test_config(), fake_factory(Arc::new(AtomicUsize::new(0))))
    }

    pub(crate) fn noisy_image() -> RgbaImage {
        RgbaImage::from_fn(640, 640, |x, y| Rgba([(x % 256) as u8, (y % 256) as u8, 90, 255]))
    }

    fn matcher() -> IdentityMatcher<MemoryStore> {
        IdentityMatcher::new(MemoryStore::new(), MatcherConfig::default())
    }

    #[test]
    fn test_models_load_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let engine = FaceEngine::with_session_factory(test_config(), fake_factory(loads.clone()));
        assert_eq!(loads.load(Ordering::SeqCst), 0);
        assert!(engine.is_loaded());
        engine.detect(&noisy_image(), None).unwrap();
        engine.detect(&noisy_image(), None).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_detect_with_auto_tuning() {
        let engine = fake_engine();
        let faces = engine.detect(&noisy_image(), None).unwrap();
        assert_eq!(faces.len(), 1);
    }

    #[test]
    fn test_process_image_matches_across_images() {
        let engine = fake_engine();
        let matcher = matcher();
        let cancel = CancelToken::new();

        let first = engine
            .process_image("a.jpg", &noisy_image(), None, &matcher, &cancel)
            .unwrap();
        assert_eq!(first.faces.len(), 1);
        assert_eq!(first.matches.len(), 1);
        assert!(first.matches[0].created);

        let second = engine
            .process_image("b.jpg", &noisy_image(), None, &matcher, &cancel)
            .unwrap();
        assert!(!second.matches[0].created);
        assert_eq!(second.matches[0].identity_id, first.matches[0].identity_id);
        assert!(second.matches[0].similarity > 0.99);
    }

    #[test]
    fn test_unavailable_models_return_empty() {
        let factory: SessionFactory =
            Box::new(|spec: &ModelSpec| Err(InferenceError::ModelNotFound(spec.path.display().to_string())));
        let engine = FaceEngine::with_session_factory(test_config(), factory);
        let image = noisy_image();

        assert!(!engine.is_loaded());
        assert!(matches!(engine.status().detector, LoadStatus::Unavailable(_)));
        assert!(engine.detect(&image, None).unwrap().is_empty());

        let face = crate::recognizer::tests::face_at_reference();
        assert!(engine.embed(&image, &face).unwrap().is_none());
        assert!(matches!(engine.calibrate(&image, 1), Err(EngineError::Unavailable(_))));

        let matcher = matcher();
        let report = engine
            .process_image("a.jpg", &image, None, &matcher, &CancelToken::new())
            .unwrap();
        assert!(report.matches.is_empty());
        assert!(report.mutations.is_empty());
    }

    #[test]
    fn test_missing_output_is_misconfigured() {
        let factory: SessionFactory = Box::new(|spec: &ModelSpec| {
            let session: Box<dyn InferenceSession> = if spec.model_id == "det" {
                let mut fake = FakeDetectorSession::new();
                fake.names.retain(|n| n != "bbox_32");
                Box::new(fake)
            } else {
                Box::new(FakeEmbedderSession::new(512))
            };
            Ok(session)
        });
        let engine = FaceEngine::with_session_factory(test_config(), factory);
        assert!(!engine.is_loaded());
        let err = engine.detect(&noisy_image(), None).unwrap_err();
        assert!(matches!(err, EngineError::Misconfigured(reason) if reason.contains("bbox_32")));
    }

    struct NoOutputSession;

    impl InferenceSession for NoOutputSession {
        fn output_names(&self) -> Vec<String> {
            Vec::new()
        }

        fn run(&mut self, _input: ndarray::ArrayView4<'_, f32>) -> Result<crate::session::TensorMap, InferenceError> {
            Ok(crate::session::TensorMap::new())
        }
    }

    /// Embedder whose first run fails; later runs delegate to the fake.
    struct FlakyEmbedderSession {
        inner: FakeEmbedderSession,
        runs: usize,
    }

    impl InferenceSession for FlakyEmbedderSession {
        fn output_names(&self) -> Vec<String> {
            self.inner.output_names()
        }

        fn run(&mut self, input: ndarray::ArrayView4<'_, f32>) -> Result<crate::session::TensorMap, InferenceError> {
            self.runs += 1;
            if self.runs == 1 {
                return Err(InferenceError::Failed("transient".into()));
            }
            self.inner.run(input)
        }
    }

    #[test]
    fn test_embedder_without_outputs_fails_process_image() {
        let factory: SessionFactory = Box::new(|spec: &ModelSpec| {
            let session: Box<dyn InferenceSession> = if spec.model_id == "det" {
                Box::new(FakeDetectorSession::new())
            } else {
                Box::new(NoOutputSession)
            };
            Ok(session)
        });
        let engine = FaceEngine::with_session_factory(test_config(), factory);
        assert!(matches!(engine.status().embedder, LoadStatus::Misconfigured(_)));

        let matcher = matcher();
        let err = engine
            .process_image("a.jpg", &noisy_image(), None, &matcher, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::Misconfigured(_)));
        assert!(matcher.identities().unwrap().is_empty());
    }

    #[test]
    fn test_failed_face_is_skipped_and_others_matched() {
        let factory: SessionFactory = Box::new(|spec: &ModelSpec| {
            let session: Box<dyn InferenceSession> = if spec.model_id == "det" {
                let mut fake = FakeDetectorSession::new();
                fake.second_face = true;
                Box::new(fake)
            } else {
                Box::new(FlakyEmbedderSession {
                    inner: FakeEmbedderSession::new(512),
                    runs: 0,
                })
            };
            Ok(session)
        });
        let engine = FaceEngine::with_session_factory(test_config(), factory);
        let matcher = matcher();

        let report = engine
            .process_image("a.jpg", &noisy_image(), None, &matcher, &CancelToken::new())
            .unwrap();
        assert_eq!(report.faces.len(), 2);
        assert_eq!(report.skipped_faces, 1);
        assert_eq!(report.matches.len(), 1);
        assert_eq!(matcher.into_store().face_count(), 1);
    }

    #[test]
    fn test_cancelled_before_start() {
        let engine = fake_engine();
        let matcher = matcher();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = engine
            .process_image("a.jpg", &noisy_image(), None, &matcher, &cancel)
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert!(matcher.identities().unwrap().is_empty());
    }

    #[test]
    fn test_calibrate_single_face() {
        let engine = fake_engine();
        let calibration = engine.calibrate(&noisy_image(), 1).unwrap();
        assert!(calibration.exact);
        assert_eq!(calibration.face_count, 1);
    }

    #[test]
    fn test_config_deserializes_partial() {
        let config: EngineConfig = serde_json::from_str(r#"{"matcher": {"match_threshold": 0.6}}"#).unwrap();
        assert!((config.matcher.match_threshold - 0.6).abs() < 1e-6);
        assert_eq!(config.detector_model.model_id, DEFAULT_DETECTOR_ID);
    }
}
