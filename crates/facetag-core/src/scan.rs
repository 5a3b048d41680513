//! Batch scanning on a worker pool.

use crate::engine::{EngineError, FaceEngine, ImageReport};
use crate::matcher::IdentityMatcher;
use crate::store::IdentityStore;
use crate::tuning::Tuning;
use image::RgbaImage;
use rayon::prelude::*;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("failed to load {media_id}: {reason}")]
    Load { media_id: String, reason: String },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Shared cancellation flag, checked between images and between faces.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

type ImageLoader = Box<dyn FnOnce() -> Result<RgbaImage, String> + Send>;

/// One media item to scan. The image is decoded only when a worker picks it up.
pub struct ScanJob {
    pub media_id: String,
    loader: ImageLoader,
}

impl ScanJob {
    pub fn new(
        media_id: impl Into<String>,
        loader: impl FnOnce() -> Result<RgbaImage, String> + Send + 'static,
    ) -> Self {
        Self {
            media_id: media_id.into(),
            loader: Box::new(loader),
        }
    }
}

#[derive(Debug)]
pub struct ImageOutcome {
    pub media_id: String,
    pub result: Result<ImageReport, ScanError>,
}

impl ImageOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.result, Err(ScanError::Engine(EngineError::Cancelled)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub processed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub faces: usize,
    pub new_identities: usize,
}

impl ScanSummary {
    pub fn from_outcomes(outcomes: &[ImageOutcome]) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            match &outcome.result {
                Ok(report) => {
                    summary.processed += 1;
                    summary.faces += report.faces.len();
                    summary.new_identities += report.matches.iter().filter(|m| m.created).count();
                }
                Err(_) if outcome.is_cancelled() => summary.cancelled += 1,
                Err(_) => summary.failed += 1,
            }
        }
        summary
    }
}

/// Runs scan jobs on a dedicated rayon pool.
pub struct BatchScanner {
    pool: rayon::ThreadPool,
}

impl BatchScanner {
    pub fn new(workers: usize) -> Result<Self, ScanError> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("facetag-scan-{i}"))
            .build()?;
        tracing::info!(workers, "scan pool started");
        Ok(Self { pool })
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Scan every job end to end. Outcomes come back in job order.
    pub fn scan<S: IdentityStore>(
        &self,
        engine: &FaceEngine,
        matcher: &IdentityMatcher<S>,
        jobs: Vec<ScanJob>,
        tuning: Option<&Tuning>,
        cancel: &CancelToken,
    ) -> Vec<ImageOutcome> {
        let total = jobs.len();
        let outcomes: Vec<ImageOutcome> = self.pool.install(|| {
            jobs.into_par_iter()
                .map(|job| run_job(engine, matcher, job, tuning, cancel))
                .collect()
        });

        let summary = ScanSummary::from_outcomes(&outcomes);
        tracing::info!(
            total,
            processed = summary.processed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            faces = summary.faces,
            "scan finished"
        );
        outcomes
    }
}

fn run_job<S: IdentityStore>(
    engine: &FaceEngine,
    matcher: &IdentityMatcher<S>,
    job: ScanJob,
    tuning: Option<&Tuning>,
    cancel: &CancelToken,
) -> ImageOutcome {
    let ScanJob { media_id, loader } = job;
    if cancel.is_cancelled() {
        return ImageOutcome {
            media_id,
            result: Err(EngineError::Cancelled.into()),
        };
    }

    let result = match loader() {
        Ok(image) => engine
            .process_image(&media_id, &image, tuning, matcher, cancel)
            .map_err(ScanError::from),
        Err(reason) => {
            tracing::warn!(media_id = %media_id, reason = %reason, "image load failed");
            Err(ScanError::Load {
                media_id: media_id.clone(),
                reason,
            })
        }
    };

    ImageOutcome { media_id, result }
}
