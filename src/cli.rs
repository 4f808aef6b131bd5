use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use crate::capture::{CaptureController, FfmpegMerger};
use crate::collection::HttpCollectionClient;
use crate::dataset::{count_dataset_by_class, CountMode, DatasetLayout, LabeledSample, TrainsetBuilder};
use crate::db::Database;
use crate::metrics::CaptureMetrics;
use crate::settings::SettingsStore;

#[derive(Debug, Parser)]
#[command(name = "feedwatch", version, about = "Smart feeder edge capture and trainset builder")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Stream the camera, watch both bowls and upload event clips until Ctrl-C.
    Capture {
        #[arg(long, default_value = "feedwatch.json")]
        config: PathBuf,
        #[arg(long)]
        streaming_key: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        camera: String,
    },
    /// Merge labeled samples into a YOLO dataset.
    BuildDataset {
        /// JSON array of `{image_path, class_name, boxes}`.
        #[arg(long)]
        samples: PathBuf,
        #[arg(long)]
        dataset: PathBuf,
        #[arg(long, default_value = "feedwatch.json")]
        config: PathBuf,
        #[arg(long)]
        target: Option<usize>,
        #[arg(long)]
        train_ratio: Option<f64>,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Print file and per-class counts of a dataset.
    Stats {
        #[arg(long)]
        dataset: PathBuf,
        #[arg(long, value_enum, default_value_t = CountMode::Image)]
        mode: CountMode,
    },
    /// Write the default settings file.
    InitConfig {
        #[arg(long, default_value = "feedwatch.json")]
        config: PathBuf,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Capture {
            config,
            streaming_key,
            user,
            camera,
        } => capture(config, &streaming_key, user, &camera).await,
        Command::BuildDataset {
            samples,
            dataset,
            config,
            target,
            train_ratio,
            seed,
        } => build_dataset(samples, dataset, config, target, train_ratio, seed),
        Command::Stats { dataset, mode } => {
            let stats = count_dataset_by_class(&dataset, mode);
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::InitConfig { config } => {
            let store = SettingsStore::new(config)?;
            store.save()?;
            println!("wrote {}", store.path().display());
            Ok(())
        }
    }
}

async fn capture(config: PathBuf, streaming_key: &str, user: String, camera: &str) -> Result<()> {
    let store = SettingsStore::new(config)?;
    store.update(|s| s.collection.user_id = user);
    let settings = store.snapshot();

    let journal = settings.journal_path.clone().map(Database::new).transpose()?;

    let api = Arc::new(HttpCollectionClient::new(&settings.collection)?);
    let merger = Arc::new(FfmpegMerger::new(settings.stream.ffmpeg_bin.clone()));

    let mut controller = CaptureController::new(CaptureMetrics::new());
    controller.start_encoder(&settings.stream, camera, streaming_key, &settings.capture.segment_dir)?;
    log::info!("encoder warming up for {}s", settings.stream.warmup_secs);
    tokio::time::sleep(Duration::from_secs(settings.stream.warmup_secs)).await;

    if let Err(err) = controller
        .start_capture(&settings, api, merger, journal.clone())
        .await
    {
        controller.stop().await?;
        return Err(err);
    }
    log::info!("capture running for user {}; Ctrl-C to stop", settings.collection.user_id);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    log::info!("shutting down");
    controller.stop().await?;

    if let Some(db) = journal {
        let counts = db.clip_outcome_counts().await?;
        log::info!(
            "journal: uploaded={} dropped={} failed={} events_recorded={}",
            counts.uploaded,
            counts.dropped,
            counts.failed,
            counts.events_recorded
        );
    }
    Ok(())
}

fn build_dataset(
    samples: PathBuf,
    dataset: PathBuf,
    config: PathBuf,
    target: Option<usize>,
    train_ratio: Option<f64>,
    seed: Option<u64>,
) -> Result<()> {
    let mut settings = SettingsStore::new(config)?.snapshot().builder;
    if let Some(target) = target {
        settings.target_per_class = target;
    }
    if let Some(ratio) = train_ratio {
        settings.train_ratio = ratio;
    }
    if seed.is_some() {
        settings.seed = seed;
    }

    let raw = fs::read_to_string(&samples)
        .with_context(|| format!("failed to read samples from {}", samples.display()))?;
    let samples: Vec<LabeledSample> =
        serde_json::from_str(&raw).context("samples file is not a JSON list of labeled samples")?;

    let mut builder = TrainsetBuilder::new(DatasetLayout::new(dataset), &settings);
    let report = builder.build(&samples)?;

    println!("manifest: {}", report.manifest_path.display());
    println!("added train: {}", report.added_train);
    println!("added valid: {}", report.added_valid);
    Ok(())
}
