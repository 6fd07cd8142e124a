//! Affectus - multi-label emotion classifier with intensity regression
//!
//! Usage:
//!   affectus train                        Two-stage training, writes artifacts/final_model
//!   affectus evaluate                     Test-split metrics
//!   affectus baselines --corpus FILE      Reference logit statistics
//!   affectus temperature                  Per-label temperature scaling
//!   affectus thresholds                   Deviation thresholds from baselines
//!   affectus predict "text" ...           Calibrated predictions
//!   affectus labels                       Label manifest of the saved snapshot
//!   affectus --help                       Show all commands

use anyhow::Result;
use clap::Parser;

use affectus::cli::output::OutputMode;
use affectus::cli::{execute, load_config, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("affectus=info".parse()?),
        )
        .init();

    let mode = OutputMode::from_json_flag(cli.json);
    let config = load_config(cli.config.as_deref())?;
    execute(&cli.command, config, mode).await
}
