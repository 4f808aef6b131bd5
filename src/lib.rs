pub mod capture;
pub mod cli;
pub mod collection;
pub mod dataset;
pub mod db;
pub mod inference;
pub mod metrics;
pub mod settings;
pub mod utils;

pub use capture::{CaptureController, ClipJob, ClipOutcome, ClipStatus, EventDetector};
pub use dataset::{BuildReport, DatasetManifest, LabeledSample, TrainsetBuilder};
pub use settings::{FeederSettings, SettingsStore};

use clap::Parser;

/// Entry point of the `feedwatch` binary.
pub async fn run() -> anyhow::Result<()> {
    utils::init_logging();
    log::info!("feedwatch starting up...");
    cli::run(cli::Cli::parse()).await
}
