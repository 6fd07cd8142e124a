//! CLI interface for Affectus.

pub mod handlers;
pub mod output;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::{Config, CONFIG_ENV};
use output::OutputMode;

const DEFAULT_CONFIG: &str = "config.yaml";

/// Affectus - multi-label emotion classifier with intensity regression and calibration
#[derive(Parser)]
#[command(name = "affectus", version, about, long_about = None)]
pub struct Cli {
    /// Path to the YAML config (default: ./config.yaml)
    #[arg(long, env = CONFIG_ENV, global = true)]
    pub config: Option<PathBuf>,

    /// Output as JSON instead of human-readable format
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train the dual-head model (frozen stage, then unfrozen) and save the snapshot
    Train,

    /// Evaluate the saved snapshot on the held-out test split
    Evaluate,

    /// Compute per-label logit baselines over a reference corpus
    Baselines {
        /// JSON file containing a list of strings
        #[arg(long)]
        corpus: PathBuf,
    },

    /// Fit per-label temperatures on the validation split
    Temperature,

    /// Derive deviation thresholds (needs baselines)
    Thresholds {
        /// JSON list of strings to use instead of the validation split
        #[arg(long)]
        corpus: Option<PathBuf>,
    },

    /// Score one or more texts with the saved snapshot
    Predict {
        /// Texts to classify
        #[arg(required = true)]
        texts: Vec<String>,
    },

    /// List the label manifest of the saved snapshot
    Labels,
}

/// Resolve `--config` / `AFFECTUS_CONFIG`, falling back to `./config.yaml`.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG));
    Config::load(path).with_context(|| format!("loading config {}", path.display()))
}

/// Run blocking model work off the async runtime.
async fn blocking<F>(f: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("worker task panicked")?
}

/// Execute a CLI command.
pub async fn execute(command: &Commands, config: Config, mode: OutputMode) -> Result<()> {
    match command {
        Commands::Train => blocking(move || handlers::train::handle_train(&config, mode)).await?,

        Commands::Evaluate => {
            blocking(move || handlers::train::handle_evaluate(&config, mode)).await?
        }

        Commands::Baselines { corpus } => {
            let corpus = corpus.clone();
            blocking(move || handlers::calibrate::handle_baselines(&config, &corpus, mode)).await?
        }

        Commands::Temperature => {
            blocking(move || handlers::calibrate::handle_temperature(&config, mode)).await?
        }

        Commands::Thresholds { corpus } => {
            let corpus = corpus.clone();
            blocking(move || {
                handlers::calibrate::handle_thresholds(&config, corpus.as_deref(), mode)
            })
            .await?
        }

        Commands::Predict { texts } => {
            handlers::predict::handle_predict(&config, texts.clone(), mode).await?
        }

        Commands::Labels => handlers::predict::handle_labels(&config, mode)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_predict_with_global_flags() {
        let cli = Cli::try_parse_from([
            "affectus",
            "--json",
            "predict",
            "so happy",
            "--config",
            "c.yaml",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.config.as_deref(), Some(Path::new("c.yaml")));
        match cli.command {
            Commands::Predict { texts } => assert_eq!(texts, vec!["so happy"]),
            _ => panic!("expected predict"),
        }
    }

    #[test]
    fn test_predict_requires_text() {
        assert!(Cli::try_parse_from(["affectus", "predict"]).is_err());
    }

    #[test]
    fn test_baselines_requires_corpus() {
        assert!(Cli::try_parse_from(["affectus", "baselines"]).is_err());
        let cli = Cli::try_parse_from(["affectus", "baselines", "--corpus", "c.json"]).unwrap();
        assert!(matches!(cli.command, Commands::Baselines { .. }));
    }

    #[test]
    fn test_missing_config_file_is_reported() {
        let err = load_config(Some(Path::new("/nonexistent/affectus.yaml"))).unwrap_err();
        assert!(format!("{:#}", err).contains("affectus.yaml"));
    }
}
