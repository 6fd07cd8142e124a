//! CLI command handlers.

pub mod calibrate;
pub mod predict;
pub mod train;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::data::{encode_examples, read_jsonl, split_dataset, DatasetSplits};
use crate::labels::LabelSet;

/// Read the configured dataset and cut it exactly as training did.
///
/// The split is seeded, so the same dataset, fractions and seed reproduce the
/// same validation and test examples in later commands.
pub(crate) fn load_splits(config: &Config, labels: &LabelSet) -> Result<DatasetSplits> {
    let common = &config.training.common;
    let raw = read_jsonl(&config.paths.dataset, config.intensity_targets())
        .with_context(|| format!("reading dataset {}", config.paths.dataset.display()))?;
    let examples = encode_examples(raw, labels)?;
    Ok(split_dataset(
        examples,
        common.validation_fraction,
        common.test_fraction,
        common.seed,
    )?)
}
