//! facetag-core: on-device face detection, alignment, embedding and
//! identity clustering.
//!
//! Detection and embedding run via ONNX Runtime on the CPU. Identities are
//! clustered incrementally against an [`IdentityStore`].

pub mod alignment;
pub mod decode;
pub mod detector;
pub mod engine;
pub mod geometry;
pub mod matcher;
pub mod quality;
pub mod recognizer;
pub mod scan;
pub mod session;
pub mod store;
pub mod tuning;
pub mod types;

pub use engine::{EngineConfig, EngineError, FaceEngine, ImageReport, ModelSpec};
pub use matcher::{FaceMatch, IdentityMatcher, MatcherConfig};
pub use scan::{BatchScanner, CancelToken, ScanJob};
pub use store::{IdentityId, IdentityMutation, IdentityStore, MemoryStore, PersonIdentity};
pub use tuning::{Calibration, Tuning};
pub use types::{DetectedFace, Embedding, FaceBox, Landmarks};
