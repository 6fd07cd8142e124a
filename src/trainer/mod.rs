//! Two-phase fine-tuning.
//!
//! ```text
//! Uninitialized --frozen--> StageFrozen --unfrozen--> StageUnfrozen --finalize--> Finalized
//! ```
//!
//! The frozen stage trains only the heads on top of a detached encoder. The
//! unfrozen stage starts from the frozen stage's best weights and trains
//! everything. Each stage runs its own optimizer, schedule and early stopping
//! on validation macro-AUC, and ends by restoring its best checkpoint.
//!
//! An optional warm start ([`warm_start`]) fine-tunes the encoder on an
//! auxiliary corpus first, through the same epoch loop.

pub mod early_stopping;
pub mod schedule;
pub mod warm_start;

use std::path::Path;

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::calibration::CalibrationBundle;
use crate::config::{CommonTrainingConfig, StageConfig, TrainingConfig, WarmStartConfig};
use crate::data::{Collator, Example};
use crate::error::{AffectError, Result};
use crate::labels::LabelSet;
use crate::loss::{CompositeLoss, LossFunction};
use crate::metrics::EvalMetrics;
use crate::model::{Checkpoint, DualHeadModel, ParamGroup};

pub use early_stopping::{EarlyStopping, StopDecision};
pub use schedule::LrSchedule;
pub use warm_start::WarmStartTrainer;

pub const SUMMARY_FILE: &str = "training_summary.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Uninitialized,
    StageFrozen,
    StageUnfrozen,
    Finalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    WarmStart,
    Frozen,
    Unfrozen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub learning_rate: f64,
    pub validation: EvalMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    pub epochs_run: usize,
    pub best_epoch: Option<usize>,
    pub best_macro_auc: Option<f64>,
    pub stopped_early: bool,
    pub optimizer_steps: usize,
    /// Batches dropped because their loss was not finite.
    pub skipped_batches: usize,
    /// Optimizer steps dropped because the accumulated gradient was not finite.
    pub skipped_steps: usize,
    pub history: Vec<EpochRecord>,
}

/// Persisted next to the final weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub labels: Vec<String>,
    pub stages: Vec<StageReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<EvalMetrics>,
    pub finished_at: DateTime<Utc>,
}

/// Evaluate `model` over `examples` in chunks of `batch_size`.
///
/// When `loss` is given, the mean finite batch loss is reported as well.
pub fn evaluate_examples(
    model: &DualHeadModel,
    collator: &Collator,
    examples: &[Example],
    batch_size: usize,
    loss: Option<&dyn LossFunction>,
) -> Result<EvalMetrics> {
    if examples.is_empty() {
        return Err(AffectError::Data("cannot evaluate an empty split".into()));
    }
    let mut probs = Vec::with_capacity(examples.len());
    let mut labels = Vec::with_capacity(examples.len());
    let mut intensity_pred = Vec::with_capacity(examples.len());
    let mut intensity_true = Vec::with_capacity(examples.len());
    let mut loss_sum = 0.0f64;
    let mut loss_batches = 0usize;

    for chunk in examples.chunks(batch_size.max(1)) {
        let refs: Vec<&Example> = chunk.iter().collect();
        let batch = collator.collate(&refs)?;
        let output = model.forward(&batch.input_ids, &batch.attention_mask)?;

        if let Some(loss) = loss {
            let (_, components) = loss.compute(&output, &batch)?;
            if components.total.is_finite() {
                loss_sum += components.total as f64;
                loss_batches += 1;
            }
        }

        probs.extend(candle_nn::ops::sigmoid(&output.emotion_logits)?.to_vec2::<f32>()?);
        intensity_pred.extend(output.intensity_logit.flatten_all()?.to_vec1::<f32>()?);
        for example in chunk {
            labels.push(example.labels.clone());
            intensity_true.push(example.intensity);
        }
    }

    let mut metrics = EvalMetrics::compute(&probs, &labels, &intensity_pred, &intensity_true);
    if loss_batches > 0 {
        metrics.loss = Some(loss_sum / loss_batches as f64);
    }
    Ok(metrics)
}

fn accumulate(pending: &mut Option<GradStore>, grads: GradStore, vars: &[Var]) -> Result<()> {
    let Some(acc) = pending.as_mut() else {
        *pending = Some(grads);
        return Ok(());
    };
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            let sum = match acc.get(var.as_tensor()) {
                Some(prev) => (prev + g)?,
                None => g.clone(),
            };
            acc.insert(var.as_tensor(), sum);
        }
    }
    Ok(())
}

fn global_grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut sq = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            sq += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(sq.sqrt())
}

fn clip_gradients(grads: &mut GradStore, vars: &[Var], norm: f64, max_norm: f64) -> Result<()> {
    if norm <= max_norm {
        return Ok(());
    }
    let scale = max_norm / (norm + 1e-6);
    for var in vars {
        let scaled = match grads.get(var.as_tensor()) {
            Some(g) => g.affine(scale, 0.0)?,
            None => continue,
        };
        grads.insert(var.as_tensor(), scaled);
    }
    Ok(())
}

pub(crate) fn save_tokenizer(collator: &Collator, dir: &Path) -> Result<()> {
    let path = dir.join(TOKENIZER_FILE);
    collator
        .tokenizer()
        .save(&path, true)
        .map_err(|e| AffectError::artifact(&path, format!("failed to write tokenizer: {}", e)))
}

struct StepContext<'a> {
    optimizer: &'a mut AdamW,
    schedule: &'a LrSchedule,
    vars: &'a [Var],
    max_grad_norm: Option<f64>,
    step: usize,
    skipped_steps: usize,
}

impl StepContext<'_> {
    fn apply(&mut self, grads: Option<GradStore>) -> Result<()> {
        let Some(mut grads) = grads else {
            return Ok(());
        };
        let norm = global_grad_norm(&grads, self.vars)?;
        if !norm.is_finite() {
            warn!("Non-finite gradient norm at step {}, skipping update", self.step);
            self.skipped_steps += 1;
            return Ok(());
        }
        if let Some(max_norm) = self.max_grad_norm {
            clip_gradients(&mut grads, self.vars, norm, max_norm)?;
        }
        self.optimizer.set_learning_rate(self.schedule.lr_at(self.step));
        self.optimizer.step(&grads)?;
        self.step += 1;
        Ok(())
    }
}

/// Batch sizes, seed and optimizer knobs shared by every epoch loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopSettings {
    pub seed: u64,
    pub weight_decay: f64,
    pub train_batch_size: usize,
    pub eval_batch_size: usize,
    pub gradient_accumulation_steps: usize,
}

impl From<&CommonTrainingConfig> for LoopSettings {
    fn from(c: &CommonTrainingConfig) -> Self {
        Self {
            seed: c.seed,
            weight_decay: c.weight_decay,
            train_batch_size: c.train_batch_size,
            eval_batch_size: c.eval_batch_size,
            gradient_accumulation_steps: c.gradient_accumulation_steps,
        }
    }
}

impl From<&WarmStartConfig> for LoopSettings {
    fn from(c: &WarmStartConfig) -> Self {
        Self {
            seed: c.seed,
            weight_decay: c.weight_decay,
            train_batch_size: c.train_batch_size,
            eval_batch_size: c.eval_batch_size,
            gradient_accumulation_steps: c.gradient_accumulation_steps,
        }
    }
}

/// One stage's epoch loop over whatever the model currently has trainable.
pub(crate) struct StageRunner<'a> {
    pub model: &'a DualHeadModel,
    pub loss: &'a dyn LossFunction,
    pub collator: &'a Collator,
    pub settings: LoopSettings,
}

impl StageRunner<'_> {
    pub fn run(
        &self,
        stage: Stage,
        stage_cfg: &StageConfig,
        train: &[Example],
        validation: &[Example],
    ) -> Result<StageReport> {
        if train.is_empty() {
            return Err(AffectError::Data("training split is empty".into()));
        }
        if validation.is_empty() {
            return Err(AffectError::Data("validation split is empty".into()));
        }
        let settings = self.settings;
        let batch_size = settings.train_batch_size.max(1);
        let accumulation = settings.gradient_accumulation_steps.max(1);

        let batches_per_epoch = train.len().div_ceil(batch_size);
        let steps_per_epoch = batches_per_epoch.div_ceil(accumulation);
        let schedule = LrSchedule::new(
            stage_cfg.lr_scheduler_type,
            stage_cfg.learning_rate,
            stage_cfg.warmup_ratio,
            steps_per_epoch * stage_cfg.num_epochs,
        );

        let vars = self.model.trainable_vars();
        let mut optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: schedule.lr_at(0),
                weight_decay: settings.weight_decay,
                ..Default::default()
            },
        )?;

        info!(
            "{:?} stage: {} trainable tensors, {} epochs, {} steps ({} warmup)",
            stage,
            vars.len(),
            stage_cfg.num_epochs,
            schedule.total_steps(),
            schedule.warmup_steps()
        );

        let mut stopper = EarlyStopping::new(
            stage_cfg.early_stopping_patience,
            stage_cfg.early_stopping_threshold,
        );
        let mut best: Option<(f64, usize, Checkpoint)> = None;
        let mut history = Vec::new();
        let mut skipped_batches = 0usize;
        let mut stopped_early = false;
        let mut ctx = StepContext {
            optimizer: &mut optimizer,
            schedule: &schedule,
            vars: &vars,
            max_grad_norm: stage_cfg.max_grad_norm,
            step: 0,
            skipped_steps: 0,
        };

        for epoch in 0..stage_cfg.num_epochs {
            let mut order: Vec<usize> = (0..train.len()).collect();
            let mut rng = StdRng::seed_from_u64(settings.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);

            let mut pending: Option<GradStore> = None;
            let mut micro = 0usize;
            let mut loss_sum = 0.0f64;
            let mut loss_count = 0usize;
            let lr = ctx.schedule.lr_at(ctx.step);

            for (batch_idx, chunk) in order.chunks(batch_size).enumerate() {
                let examples: Vec<&Example> = chunk.iter().map(|&i| &train[i]).collect();
                let batch = self.collator.collate(&examples)?;
                let output = self.model.forward(&batch.input_ids, &batch.attention_mask)?;
                let (loss, components) = self.loss.compute(&output, &batch)?;

                if !components.total.is_finite() {
                    warn!(
                        "{:?} epoch {} batch {}: non-finite loss {:?}, skipping",
                        stage, epoch, batch_idx, components
                    );
                    skipped_batches += 1;
                    continue;
                }
                debug!(
                    "batch {}: total={:.4} emotion={:.4} intensity={:.4} metric={:.4} pairs={}",
                    batch_idx,
                    components.total,
                    components.emotion,
                    components.intensity,
                    components.metric,
                    components.metric_pairs
                );
                loss_sum += components.total as f64;
                loss_count += 1;

                let grads = loss.affine(1.0 / accumulation as f64, 0.0)?.backward()?;
                accumulate(&mut pending, grads, &vars)?;
                micro += 1;
                if micro == accumulation {
                    ctx.apply(pending.take())?;
                    micro = 0;
                }
            }
            if micro > 0 {
                ctx.apply(pending.take())?;
            }

            let metrics = evaluate_examples(
                self.model,
                self.collator,
                validation,
                settings.eval_batch_size,
                Some(self.loss),
            )?;
            let train_loss = if loss_count > 0 {
                loss_sum / loss_count as f64
            } else {
                f64::NAN
            };
            info!(
                "{:?} epoch {}/{}: train_loss={:.4} {}",
                stage,
                epoch + 1,
                stage_cfg.num_epochs,
                train_loss,
                metrics.summary()
            );

            let monitored = metrics.macro_auc;
            if best.as_ref().map_or(true, |(b, _, _)| monitored > *b) {
                best = Some((monitored, epoch, self.model.checkpoint()?));
            }
            history.push(EpochRecord {
                epoch,
                train_loss,
                learning_rate: lr,
                validation: metrics,
            });

            if stopper.observe(monitored) == StopDecision::Stop {
                info!(
                    "{:?} stage: early stop after epoch {} (best macro_auc {:.4})",
                    stage,
                    epoch + 1,
                    stopper.best().unwrap_or(f64::NAN)
                );
                stopped_early = true;
                break;
            }
        }

        let (best_macro_auc, best_epoch) = match &best {
            Some((metric, epoch, checkpoint)) => {
                self.model.restore(checkpoint)?;
                info!(
                    "{:?} stage: restored best weights from epoch {} (macro_auc {:.4})",
                    stage,
                    epoch + 1,
                    metric
                );
                (Some(*metric), Some(*epoch))
            }
            None => (None, None),
        };

        Ok(StageReport {
            stage,
            epochs_run: history.len(),
            best_epoch,
            best_macro_auc,
            stopped_early,
            optimizer_steps: ctx.step,
            skipped_batches,
            skipped_steps: ctx.skipped_steps,
            history,
        })
    }
}

pub struct TwoPhaseTrainer<L: LossFunction = CompositeLoss> {
    model: DualHeadModel,
    loss: L,
    collator: Collator,
    config: TrainingConfig,
    state: TrainerState,
    warm_start: Option<StageReport>,
    reports: Vec<StageReport>,
}

impl<L: LossFunction> TwoPhaseTrainer<L> {
    pub fn new(model: DualHeadModel, loss: L, collator: Collator, config: TrainingConfig) -> Self {
        Self {
            model,
            loss,
            collator,
            config,
            state: TrainerState::Uninitialized,
            warm_start: None,
            reports: Vec::new(),
        }
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn model(&self) -> &DualHeadModel {
        &self.model
    }

    pub fn collator(&self) -> &Collator {
        &self.collator
    }

    pub fn reports(&self) -> &[StageReport] {
        &self.reports
    }

    pub fn into_model(self) -> DualHeadModel {
        self.model
    }

    /// Attach the report of the warm start that produced this trainer's encoder.
    pub fn record_warm_start(&mut self, report: StageReport) {
        self.warm_start = Some(report);
    }

    /// Run both stages back to back.
    pub fn fit(&mut self, train: &[Example], validation: &[Example]) -> Result<&[StageReport]> {
        self.run_frozen_stage(train, validation)?;
        self.run_unfrozen_stage(train, validation)?;
        Ok(&self.reports)
    }

    /// Train the heads with the encoder frozen.
    pub fn run_frozen_stage(
        &mut self,
        train: &[Example],
        validation: &[Example],
    ) -> Result<&StageReport> {
        if self.state != TrainerState::Uninitialized {
            return Err(AffectError::Configuration(format!(
                "frozen stage cannot start from {:?}",
                self.state
            )));
        }
        self.model.set_trainable(ParamGroup::Encoder, false);
        self.model.set_trainable(ParamGroup::Heads, true);
        let report = self.run_stage(Stage::Frozen, &self.config.frozen, train, validation)?;
        self.reports.push(report);
        self.state = TrainerState::StageFrozen;
        Ok(&self.reports[self.reports.len() - 1])
    }

    /// Train everything, starting from the frozen stage's best weights.
    pub fn run_unfrozen_stage(
        &mut self,
        train: &[Example],
        validation: &[Example],
    ) -> Result<&StageReport> {
        if self.state != TrainerState::StageFrozen {
            return Err(AffectError::Configuration(format!(
                "unfrozen stage requires a completed frozen stage, trainer is {:?}",
                self.state
            )));
        }
        self.model.set_trainable(ParamGroup::Encoder, true);
        self.model.set_trainable(ParamGroup::Heads, true);
        let report = self.run_stage(Stage::Unfrozen, &self.config.unfrozen, train, validation)?;
        self.reports.push(report);
        self.state = TrainerState::StageUnfrozen;
        Ok(&self.reports[self.reports.len() - 1])
    }

    fn run_stage(
        &self,
        stage: Stage,
        stage_cfg: &StageConfig,
        train: &[Example],
        validation: &[Example],
    ) -> Result<StageReport> {
        let runner = StageRunner {
            model: &self.model,
            loss: &self.loss,
            collator: &self.collator,
            settings: LoopSettings::from(&self.config.common),
        };
        runner.run(stage, stage_cfg, train, validation)
    }

    /// Metrics of the current weights on `examples` (e.g. the held-out test split).
    pub fn evaluate(&self, examples: &[Example]) -> Result<EvalMetrics> {
        evaluate_examples(
            &self.model,
            &self.collator,
            examples,
            self.config.common.eval_batch_size,
            Some(&self.loss),
        )
    }

    /// Persist weights, tokenizer, label manifest and training summary into `dir`.
    ///
    /// Only valid once the unfrozen stage has completed. Calibration artifacts
    /// already in `dir` are deleted.
    pub fn finalize(
        &mut self,
        dir: &Path,
        labels: &LabelSet,
        test: Option<EvalMetrics>,
    ) -> Result<TrainingSummary> {
        if self.state != TrainerState::StageUnfrozen {
            return Err(AffectError::ModelNotReady(format!(
                "cannot finalize a trainer in state {:?}",
                self.state
            )));
        }
        if labels.len() != self.model.num_labels() {
            return Err(AffectError::Data(format!(
                "{} labels for a model with {} outputs",
                labels.len(),
                self.model.num_labels()
            )));
        }
        std::fs::create_dir_all(dir)?;
        // calibration belongs to the weights being replaced
        CalibrationBundle::clear(dir)?;
        self.model.save(dir)?;
        labels.save(dir)?;

        save_tokenizer(&self.collator, dir)?;

        let summary = TrainingSummary {
            labels: labels.names().to_vec(),
            stages: self.warm_start.iter().chain(&self.reports).cloned().collect(),
            test,
            finished_at: Utc::now(),
        };
        crate::calibration::artifacts::write_json_atomic(&dir.join(SUMMARY_FILE), &summary)?;
        self.state = TrainerState::Finalized;
        info!("Finalized model snapshot at {}", dir.display());
        Ok(summary)
    }
}
