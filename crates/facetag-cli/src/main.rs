mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use facetag_core::scan::ScanSummary;
use facetag_core::store::StoreSnapshot;
use facetag_core::{BatchScanner, CancelToken, FaceEngine, IdentityId, IdentityMatcher, MemoryStore, ScanJob, Tuning};
use image::{DynamicImage, ImageDecoder, ImageReader, RgbaImage};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facetag", about = "On-device face detection and identity clustering")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect faces in an image
    Detect {
        image: PathBuf,
        /// TOML tuning file (default: auto tuning for the image size)
        #[arg(short, long)]
        tuning: Option<PathBuf>,
    },
    /// Fit a tuning so a reference image yields the expected face count
    Calibrate {
        image: PathBuf,
        #[arg(short, long)]
        expected: usize,
        /// Write the calibrated tuning to this TOML file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Detect, embed and cluster faces across images
    Scan {
        images: Vec<PathBuf>,
        #[arg(short, long)]
        tuning: Option<PathBuf>,
    },
    /// List identities
    Identities,
    /// Merge one identity into another
    Merge { source: i64, target: i64 },
    /// Rename an identity (an existing name merges)
    Rename { id: i64, name: String },
    /// Hide or unhide an identity
    Ignore {
        id: i64,
        /// Clear the flag instead of setting it
        #[arg(long)]
        undo: bool,
    },
    /// List faces produced by other models than the configured ones
    Stale,
    /// Show model load status
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Detect { image, tuning } => {
            let engine = FaceEngine::new(config.engine_config()?);
            let tuning = tuning.as_deref().map(config::load_tuning).transpose()?;
            let rgba = load_image(&image)?;
            let faces = engine.detect(&rgba, tuning.as_ref())?;
            print_json(&faces)?;
        }
        Commands::Calibrate {
            image,
            expected,
            output,
        } => {
            let engine = FaceEngine::new(config.engine_config()?);
            let rgba = load_image(&image)?;
            let calibration = engine.calibrate(&rgba, expected)?;
            if let Some(path) = output {
                let text = toml::to_string_pretty(&calibration.tuning)?;
                std::fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?;
                tracing::info!(path = %path.display(), "tuning written");
            }
            print_json(&calibration)?;
        }
        Commands::Scan { images, tuning } => {
            let engine = FaceEngine::new(config.engine_config()?);
            let tuning: Option<Tuning> = tuning.as_deref().map(config::load_tuning).transpose()?;
            let matcher = IdentityMatcher::new(load_store(&config.store_path)?, engine.config().matcher);
            let scanner = BatchScanner::new(config.workers)?;

            let jobs = images
                .into_iter()
                .map(|path| {
                    let media_id = path.display().to_string();
                    ScanJob::new(media_id, move || load_image(&path).map_err(|e| format!("{e:#}")))
                })
                .collect();
            let outcomes = scanner.scan(&engine, &matcher, jobs, tuning.as_ref(), &CancelToken::new());

            for outcome in &outcomes {
                match &outcome.result {
                    Ok(report) => print_json(report)?,
                    Err(e) => eprintln!("{}: {e}", outcome.media_id),
                }
            }
            print_json(&ScanSummary::from_outcomes(&outcomes))?;
            save_store(&config.store_path, &matcher.into_store())?;
        }
        Commands::Identities => {
            let store = load_store(&config.store_path)?;
            print_json(&store.snapshot().identities)?;
        }
        Commands::Merge { source, target } => {
            let matcher = IdentityMatcher::new(load_store(&config.store_path)?, config.engine_config()?.matcher);
            let outcome = matcher.merge(IdentityId(source), IdentityId(target))?;
            print_json(&outcome)?;
            save_store(&config.store_path, &matcher.into_store())?;
        }
        Commands::Rename { id, name } => {
            let matcher = IdentityMatcher::new(load_store(&config.store_path)?, config.engine_config()?.matcher);
            let outcome = matcher.rename(IdentityId(id), &name)?;
            print_json(&outcome)?;
            save_store(&config.store_path, &matcher.into_store())?;
        }
        Commands::Ignore { id, undo } => {
            let matcher = IdentityMatcher::new(load_store(&config.store_path)?, config.engine_config()?.matcher);
            let outcome = matcher.set_ignored(IdentityId(id), !undo)?;
            print_json(&outcome)?;
            save_store(&config.store_path, &matcher.into_store())?;
        }
        Commands::Stale => {
            let engine_config = config.engine_config()?;
            let matcher = IdentityMatcher::new(load_store(&config.store_path)?, engine_config.matcher);
            let stale = matcher.stale_faces(
                &engine_config.detector_model.model_id,
                &engine_config.embedder_model.model_id,
            )?;
            print_json(&stale)?;
        }
        Commands::Status => {
            let engine = FaceEngine::new(config.engine_config()?);
            print_json(&engine.status())?;
        }
    }

    Ok(())
}

/// Decode an image file and apply its EXIF orientation.
fn load_image(path: &Path) -> Result<RgbaImage> {
    let mut decoder = ImageReader::open(path)
        .with_context(|| format!("opening {}", path.display()))?
        .with_guessed_format()?
        .into_decoder()
        .with_context(|| format!("decoding {}", path.display()))?;
    let orientation = decoder.orientation()?;
    let mut image = DynamicImage::from_decoder(decoder)?;
    image.apply_orientation(orientation);
    Ok(image.to_rgba8())
}

fn load_store(path: &Path) -> Result<MemoryStore> {
    if !path.exists() {
        return Ok(MemoryStore::new());
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let snapshot: StoreSnapshot = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(MemoryStore::from_snapshot(snapshot))
}

fn save_store(path: &Path, store: &MemoryStore) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(&store.snapshot())?;
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
    tracing::debug!(path = %path.display(), "store saved");
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
