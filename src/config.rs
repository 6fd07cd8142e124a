//! Typed training/calibration configuration.
//!
//! Loaded once from a YAML document and passed by reference to the trainer,
//! calibration stages and CLI handlers. Unknown keys and missing required
//! sections fail at load time, before any model is touched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::data::{IntensityRange, IntensityTargets};
use crate::error::{AffectError, Result};
use crate::model::Pooling;

/// Environment variable naming the config file when `--config` is not given.
pub const CONFIG_ENV: &str = "AFFECTUS_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub model: ModelConfig,
    pub paths: PathsConfig,
    pub training: TrainingConfig,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// HuggingFace repo id or a local directory with config/tokenizer/weights.
    pub name: String,
    pub max_length: usize,
    #[serde(default)]
    pub pooling: Pooling,
    /// Pinned label order. Derived (sorted) from the training data when absent.
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    /// Optional roll-up of fine labels into coarse categories for serving.
    #[serde(default)]
    pub categories: BTreeMap<String, Vec<String>>,
    /// Dataset intensities outside this range are rejected at load time.
    #[serde(default)]
    pub intensity_range: IntensityRange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    pub dataset: PathBuf,
    pub artifacts_dir: PathBuf,
}

impl PathsConfig {
    /// Directory holding the finalized model snapshot and calibration artifacts.
    pub fn final_model_dir(&self) -> PathBuf {
        self.artifacts_dir.join("final_model")
    }

    /// Directory holding the warm-started encoder, when a warm start is configured.
    pub fn warm_start_dir(&self) -> PathBuf {
        self.artifacts_dir.join("base_model")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingConfig {
    pub common: CommonTrainingConfig,
    pub frozen: StageConfig,
    pub unfrozen: StageConfig,
    #[serde(default)]
    pub warm_start: Option<WarmStartConfig>,
}

/// Encoder warm start on an auxiliary multi-label corpus (e.g. GoEmotions),
/// run before the frozen stage. Intensity is not used.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WarmStartConfig {
    pub dataset: PathBuf,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    pub seed: u64,
    pub weight_decay: f64,
    pub train_batch_size: usize,
    pub eval_batch_size: usize,
    #[serde(default = "default_accumulation")]
    pub gradient_accumulation_steps: usize,
    #[serde(default = "default_warm_start_pos_weight_cap")]
    pub pos_weight_cap: f32,
    #[serde(default = "default_split_fraction")]
    pub validation_fraction: f64,
    pub stage: StageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommonTrainingConfig {
    pub seed: u64,
    pub weight_decay: f64,
    pub train_batch_size: usize,
    pub eval_batch_size: usize,
    #[serde(default = "default_accumulation")]
    pub gradient_accumulation_steps: usize,
    pub intensity_loss_weight: f64,
    pub metric_loss_weight: f64,
    #[serde(default = "default_pos_weight_cap")]
    pub pos_weight_cap: f32,
    #[serde(default = "default_split_fraction")]
    pub validation_fraction: f64,
    #[serde(default = "default_split_fraction")]
    pub test_fraction: f64,
}

/// Per-stage optimisation settings (frozen and unfrozen are configured independently).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub learning_rate: f64,
    pub num_epochs: usize,
    #[serde(default)]
    pub warmup_ratio: f64,
    #[serde(default)]
    pub lr_scheduler_type: SchedulerKind,
    pub early_stopping_patience: usize,
    #[serde(default)]
    pub early_stopping_threshold: f64,
    #[serde(default)]
    pub max_grad_norm: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    #[default]
    Linear,
    Cosine,
    Constant,
}

/// Composite loss knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LossConfig {
    /// Rows whose max emotion probability is below this count as neutral-like.
    pub confidence_floor: f32,
    /// |intensity| tolerated for neutral-like rows before the hinge engages.
    pub dead_zone: f32,
    /// Multiplier on the neutral-suppression term.
    pub neutral_weight: f32,
    /// Jaccard overlap above which two rows form a positive pair.
    pub overlap_threshold: f32,
    /// Minimum number of non-neutral rows before the metric term is evaluated.
    pub min_metric_rows: usize,
    pub ms_alpha: f32,
    pub ms_beta: f32,
    pub ms_base: f32,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.05,
            dead_zone: 0.05,
            neutral_weight: 3.0,
            overlap_threshold: 0.15,
            min_metric_rows: 4,
            ms_alpha: 2.0,
            ms_beta: 5.0,
            ms_base: 0.4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CalibrationConfig {
    pub temperature_max_iter: usize,
    pub deviation: DeviationKind,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            temperature_max_iter: 100,
            deviation: DeviationKind::ZScore,
        }
    }
}

/// How per-label deviation from baseline is scored when deriving thresholds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviationKind {
    #[default]
    ZScore,
    ProbabilityDelta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EvaluationConfig {
    pub eval_batch_size: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self { eval_batch_size: 32 }
    }
}

fn default_accumulation() -> usize {
    1
}

fn default_pos_weight_cap() -> f32 {
    2.0
}

fn default_warm_start_pos_weight_cap() -> f32 {
    50.0
}

fn default_split_fraction() -> f64 {
    0.15
}

impl Config {
    /// Load and validate a YAML config file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AffectError::Configuration(format!(
                "Config not found: {}",
                path.display()
            )));
        }
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AffectError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml(&contents)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// How the main dataset's intensity field is checked.
    pub fn intensity_targets(&self) -> IntensityTargets {
        IntensityTargets::Required(self.model.intensity_range)
    }

    /// Reject values that would only fail mid-training.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(AffectError::Configuration(msg));

        if self.model.name.trim().is_empty() {
            return fail("model.name must not be empty".into());
        }
        if self.model.max_length == 0 {
            return fail("model.max_length must be > 0".into());
        }
        if let Some(labels) = &self.model.labels {
            if labels.is_empty() {
                return fail("model.labels must not be empty when given".into());
            }
            let mut seen = std::collections::HashSet::new();
            for label in labels {
                if !seen.insert(label) {
                    return fail(format!("model.labels contains duplicate '{}'", label));
                }
            }
        }

        let common = &self.training.common;
        if common.train_batch_size == 0 || common.eval_batch_size == 0 {
            return fail("training batch sizes must be > 0".into());
        }
        if common.gradient_accumulation_steps == 0 {
            return fail("training.common.gradient_accumulation_steps must be > 0".into());
        }
        if common.weight_decay < 0.0 {
            return fail("training.common.weight_decay must be >= 0".into());
        }
        if common.intensity_loss_weight < 0.0 || common.metric_loss_weight < 0.0 {
            return fail("loss term weights must be >= 0".into());
        }
        if common.pos_weight_cap <= 0.0 {
            return fail("training.common.pos_weight_cap must be > 0".into());
        }
        let splits = [common.validation_fraction, common.test_fraction];
        if splits.iter().any(|f| !(0.0..1.0).contains(f))
            || common.validation_fraction + common.test_fraction >= 1.0
        {
            return fail("validation/test fractions must be in [0,1) and sum below 1".into());
        }

        let range = &self.model.intensity_range;
        if !(range.min.is_finite() && range.max.is_finite() && range.min < range.max) {
            return fail("model.intensity_range needs finite min < max".into());
        }

        validate_stage("training.frozen", &self.training.frozen)?;
        validate_stage("training.unfrozen", &self.training.unfrozen)?;

        if let Some(warm) = &self.training.warm_start {
            if warm.train_batch_size == 0 || warm.eval_batch_size == 0 {
                return fail("training.warm_start batch sizes must be > 0".into());
            }
            if warm.gradient_accumulation_steps == 0 {
                return fail("training.warm_start.gradient_accumulation_steps must be > 0".into());
            }
            if warm.weight_decay < 0.0 {
                return fail("training.warm_start.weight_decay must be >= 0".into());
            }
            if warm.pos_weight_cap <= 0.0 {
                return fail("training.warm_start.pos_weight_cap must be > 0".into());
            }
            if !(0.0..1.0).contains(&warm.validation_fraction) || warm.validation_fraction == 0.0 {
                return fail("training.warm_start.validation_fraction must be in (0,1)".into());
            }
            if let Some(labels) = &warm.labels {
                if labels.is_empty() {
                    return fail("training.warm_start.labels must not be empty when given".into());
                }
            }
            validate_stage("training.warm_start.stage", &warm.stage)?;
        }

        if self.calibration.temperature_max_iter == 0 {
            return fail("calibration.temperature_max_iter must be > 0".into());
        }
        if self.evaluation.eval_batch_size == 0 {
            return fail("evaluation.eval_batch_size must be > 0".into());
        }
        Ok(())
    }
}

fn validate_stage(name: &str, stage: &StageConfig) -> Result<()> {
    let fail = |msg: String| Err(AffectError::Configuration(msg));
    if !(stage.learning_rate > 0.0) {
        return fail(format!("{name}.learning_rate must be > 0"));
    }
    if stage.num_epochs == 0 {
        return fail(format!("{name}.num_epochs must be > 0"));
    }
    if !(0.0..1.0).contains(&stage.warmup_ratio) {
        return fail(format!("{name}.warmup_ratio must be in [0,1)"));
    }
    if stage.early_stopping_threshold < 0.0 {
        return fail(format!("{name}.early_stopping_threshold must be >= 0"));
    }
    if matches!(stage.max_grad_norm, Some(n) if !(n > 0.0)) {
        return fail(format!("{name}.max_grad_norm must be > 0"));
    }
    Ok(())
}
