//! Encoder warm start on an auxiliary multi-label corpus.
//!
//! The whole model trains under [`WeightedBceLoss`] with heads sized for the
//! auxiliary label set. Only the encoder carries forward; the frozen and
//! unfrozen stages put fresh heads over it.

use std::path::Path;

use candle_core::Device;
use chrono::Utc;
use tracing::info;

use crate::calibration::artifacts::write_json_atomic;
use crate::config::{StageConfig, WarmStartConfig};
use crate::data::{Collator, Example};
use crate::encoder::TextEncoder;
use crate::error::{AffectError, Result};
use crate::labels::LabelSet;
use crate::loss::WeightedBceLoss;
use crate::model::{DualHeadModel, ParamGroup, Pooling};

use super::{
    save_tokenizer, LoopSettings, Stage, StageReport, StageRunner, TrainingSummary, SUMMARY_FILE,
};

pub struct WarmStartTrainer {
    model: DualHeadModel,
    loss: WeightedBceLoss,
    settings: LoopSettings,
    stage: StageConfig,
    report: Option<StageReport>,
}

impl WarmStartTrainer {
    /// Put throwaway heads for `pos_weight.len()` auxiliary labels over `encoder`.
    pub fn new(
        encoder: Box<dyn TextEncoder>,
        pooling: Pooling,
        pos_weight: &[f32],
        config: &WarmStartConfig,
        device: &Device,
    ) -> Result<Self> {
        let loss = WeightedBceLoss::new(pos_weight, device)?;
        let mut model = DualHeadModel::new(encoder, pos_weight.len(), pooling, None, device)?;
        model.set_trainable(ParamGroup::Encoder, true);
        model.set_trainable(ParamGroup::Heads, true);
        Ok(Self {
            model,
            loss,
            settings: LoopSettings::from(config),
            stage: config.stage.clone(),
            report: None,
        })
    }

    pub fn model(&self) -> &DualHeadModel {
        &self.model
    }

    pub fn report(&self) -> Option<&StageReport> {
        self.report.as_ref()
    }

    /// Fine-tune encoder and heads together; ends on the best validation epoch.
    pub fn run(
        &mut self,
        collator: &Collator,
        train: &[Example],
        validation: &[Example],
    ) -> Result<&StageReport> {
        if self.report.is_some() {
            return Err(AffectError::Configuration(
                "warm start has already run".into(),
            ));
        }
        let runner = StageRunner {
            model: &self.model,
            loss: &self.loss,
            collator,
            settings: self.settings,
        };
        let report = runner.run(Stage::WarmStart, &self.stage, train, validation)?;
        info!(
            "Warm start finished after {} epochs (best macro_auc {:.4})",
            report.epochs_run,
            report.best_macro_auc.unwrap_or(f64::NAN)
        );
        Ok(self.report.insert(report))
    }

    /// Write the warm-started model with its label manifest, tokenizer and report.
    pub fn save(&self, dir: &Path, labels: &LabelSet, collator: &Collator) -> Result<()> {
        let Some(report) = &self.report else {
            return Err(AffectError::ModelNotReady(
                "warm start has not run yet".into(),
            ));
        };
        if labels.len() != self.model.num_labels() {
            return Err(AffectError::Data(format!(
                "{} labels for a warm-start head with {} outputs",
                labels.len(),
                self.model.num_labels()
            )));
        }
        std::fs::create_dir_all(dir)?;
        self.model.save(dir)?;
        labels.save(dir)?;
        save_tokenizer(collator, dir)?;
        let summary = TrainingSummary {
            labels: labels.names().to_vec(),
            stages: vec![report.clone()],
            test: None,
            finished_at: Utc::now(),
        };
        write_json_atomic(&dir.join(SUMMARY_FILE), &summary)?;
        info!("Saved warm-started encoder to {}", dir.display());
        Ok(())
    }

    pub fn into_encoder(self) -> Box<dyn TextEncoder> {
        self.model.into_encoder()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerKind;
    use crate::encoder::TokenEmbeddingEncoder;
    use crate::testing::{tiny_examples, word_level_tokenizer};

    fn config() -> WarmStartConfig {
        WarmStartConfig {
            dataset: "unused.jsonl".into(),
            labels: None,
            seed: 3,
            weight_decay: 0.0,
            train_batch_size: 4,
            eval_batch_size: 8,
            gradient_accumulation_steps: 1,
            pos_weight_cap: 50.0,
            validation_fraction: 0.2,
            stage: StageConfig {
                learning_rate: 0.05,
                num_epochs: 2,
                warmup_ratio: 0.0,
                lr_scheduler_type: SchedulerKind::Constant,
                early_stopping_patience: 0,
                early_stopping_threshold: 0.0,
                max_grad_norm: None,
            },
        }
    }

    fn encoder_values(model: &DualHeadModel) -> Vec<Vec<f32>> {
        model
            .group_vars(ParamGroup::Encoder)
            .iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect()
    }

    fn setup() -> (WarmStartTrainer, Collator) {
        let device = Device::Cpu;
        let tokenizer = word_level_tokenizer();
        let vocab = tokenizer.get_vocab_size(true);
        let collator = Collator::new(tokenizer, 16, device.clone()).unwrap();
        let encoder = TokenEmbeddingEncoder::new(vocab, 8, &device).unwrap();
        let trainer =
            WarmStartTrainer::new(Box::new(encoder), Pooling::Mean, &[1.0, 1.0], &config(), &device)
                .unwrap();
        (trainer, collator)
    }

    #[test]
    fn test_warm_start_trains_encoder_and_hands_it_over() {
        let examples = tiny_examples();
        let (mut trainer, collator) = setup();
        let before = encoder_values(trainer.model());

        let report = trainer.run(&collator, &examples, &examples).unwrap().clone();
        assert_eq!(report.stage, Stage::WarmStart);
        assert_eq!(report.epochs_run, 2);
        assert!(report.best_macro_auc.is_some());
        let trained = encoder_values(trainer.model());
        assert_ne!(trained, before);

        // fresh heads for a different label count over the same encoder weights
        let encoder = trainer.into_encoder();
        let main = DualHeadModel::new(encoder, 3, Pooling::Mean, None, &Device::Cpu).unwrap();
        assert_eq!(main.num_labels(), 3);
        assert_eq!(encoder_values(&main), trained);
    }

    #[test]
    fn test_warm_start_runs_once_and_saves_after_running() {
        let examples = tiny_examples();
        let labels = LabelSet::new(vec!["joy".into(), "fear".into()]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (mut trainer, collator) = setup();

        let err = trainer.save(dir.path(), &labels, &collator).unwrap_err();
        assert!(matches!(err, AffectError::ModelNotReady(_)));

        trainer.run(&collator, &examples, &examples).unwrap();
        assert!(trainer.run(&collator, &examples, &examples).is_err());

        trainer.save(dir.path(), &labels, &collator).unwrap();
        for file in [
            crate::model::WEIGHTS_FILE,
            crate::labels::LABELS_FILE,
            crate::trainer::TOKENIZER_FILE,
            SUMMARY_FILE,
        ] {
            assert!(dir.path().join(file).exists(), "missing {}", file);
        }
        let reloaded = DualHeadModel::load(dir.path(), &Device::Cpu).unwrap();
        assert_eq!(reloaded.num_labels(), 2);
    }
}
