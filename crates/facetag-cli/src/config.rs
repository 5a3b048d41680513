use anyhow::{Context, Result};
use facetag_core::{EngineConfig, ModelSpec, Tuning};
use std::path::{Path, PathBuf};

/// CLI configuration, loaded from environment variables.
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub detector_file: String,
    pub detector_id: String,
    pub embedder_file: String,
    pub embedder_id: String,
    /// Optional TOML file with detector/embedder/matcher settings.
    pub engine_config_path: Option<PathBuf>,
    /// JSON snapshot of identities and faces.
    pub store_path: PathBuf,
    /// Scan worker threads.
    pub workers: usize,
}

impl Config {
    /// Load configuration from `FACETAG_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facetag");

        let model_dir = std::env::var("FACETAG_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        let store_path = std::env::var("FACETAG_STORE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("identities.json"));

        let default_workers = std::thread::available_parallelism().map_or(2, |n| n.get());

        Self {
            model_dir,
            detector_file: env_string("FACETAG_DETECTOR_MODEL", "det_10g.onnx"),
            detector_id: env_string("FACETAG_DETECTOR_ID", "det_10g"),
            embedder_file: env_string("FACETAG_EMBEDDER_MODEL", "w600k_r50.onnx"),
            embedder_id: env_string("FACETAG_EMBEDDER_ID", "w600k_r50"),
            engine_config_path: std::env::var("FACETAG_ENGINE_CONFIG").ok().map(PathBuf::from),
            store_path,
            workers: env_usize("FACETAG_WORKERS", default_workers),
        }
    }

    /// Engine settings: the optional TOML file, with model paths and ids from the environment.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.engine_config_path {
            Some(path) => {
                let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
                toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => EngineConfig::default(),
        };
        config.detector_model = ModelSpec::new(self.model_dir.join(&self.detector_file), self.detector_id.clone());
        config.embedder_model = ModelSpec::new(self.model_dir.join(&self.embedder_file), self.embedder_id.clone());
        Ok(config)
    }
}

/// Read a tuning from a TOML file; missing keys take the default values.
pub fn load_tuning(path: &Path) -> Result<Tuning> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing tuning {}", path.display()))
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
