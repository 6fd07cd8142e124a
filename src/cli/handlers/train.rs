//! Training and evaluation handlers.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use candle_core::Device;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::calibration::artifacts::write_json_atomic;
use crate::classifier::EmotionClassifier;
use crate::cli::output::{
    fmt_opt, output_json, print_header, print_hint, print_kv, print_metrics, print_success,
    print_table, OutputMode,
};
use crate::config::{Config, WarmStartConfig};
use crate::data::{
    encode_examples, intensity_median, label_prior_logits, read_jsonl, resolve_labels,
    split_dataset, Collator, IntensityTargets,
};
use crate::encoder::{resolve_model_files, select_device, BertTextEncoder, TextEncoder};
use crate::loss::{pos_weights, CompositeLoss};
use crate::metrics::EvalMetrics;
use crate::model::{DualHeadModel, HeadPriors};
use crate::trainer::{evaluate_examples, StageReport, TwoPhaseTrainer, WarmStartTrainer};

pub const TEST_METRICS_FILE: &str = "test_metrics.json";

#[derive(Debug, Serialize)]
struct TestReport<'a> {
    metrics: &'a EvalMetrics,
    per_label: BTreeMap<&'a str, Option<f64>>,
    evaluated_at: DateTime<Utc>,
}

pub fn handle_train(config: &Config, mode: OutputMode) -> Result<()> {
    let common = &config.training.common;
    let raw = read_jsonl(&config.paths.dataset, config.intensity_targets())
        .with_context(|| format!("reading dataset {}", config.paths.dataset.display()))?;
    let labels = resolve_labels(&raw, config.model.labels.as_deref())?;
    let splits = super::load_splits(config, &labels)?;
    info!(
        "Dataset: {} train / {} validation / {} test over {} labels",
        splits.train.len(),
        splits.validation.len(),
        splits.test.len(),
        labels.len()
    );

    let device = select_device();
    let files = resolve_model_files(&config.model.name)
        .with_context(|| format!("resolving encoder '{}'", config.model.name))?;
    let collator =
        Collator::from_file(&files.tokenizer_path, config.model.max_length, device.clone())?;
    let mut encoder: Box<dyn TextEncoder> =
        Box::new(BertTextEncoder::from_pretrained(&files, &device)?);
    let mut warm_report = None;
    if let Some(warm) = &config.training.warm_start {
        let (warmed, report) = warm_start_encoder(config, warm, encoder, &collator, &device)?;
        encoder = warmed;
        warm_report = Some(report);
    }

    let priors = HeadPriors {
        emotion_bias: label_prior_logits(&splits.train)?,
        intensity_bias: intensity_median(&splits.train)?,
    };
    let model = DualHeadModel::new(
        encoder,
        labels.len(),
        config.model.pooling,
        Some(&priors),
        &device,
    )?;
    let pos_weight = pos_weights(&splits.train, labels.len(), common.pos_weight_cap)?;
    let loss = CompositeLoss::new(
        &pos_weight,
        config.loss.clone(),
        common.intensity_loss_weight as f32,
        common.metric_loss_weight as f32,
        &device,
    )?;

    let mut trainer = TwoPhaseTrainer::new(model, loss, collator, config.training.clone());
    if let Some(report) = warm_report {
        trainer.record_warm_start(report);
    }
    trainer.fit(&splits.train, &splits.validation)?;
    let test = if splits.test.is_empty() {
        None
    } else {
        Some(trainer.evaluate(&splits.test)?)
    };

    let dir = config.paths.final_model_dir();
    let summary = trainer.finalize(&dir, &labels, test)?;
    let stale_metrics = dir.join(TEST_METRICS_FILE);
    if stale_metrics.exists() {
        std::fs::remove_file(&stale_metrics)
            .with_context(|| format!("removing {}", stale_metrics.display()))?;
    }

    if mode == OutputMode::Json {
        output_json(&summary)?;
        return Ok(());
    }

    print_header("Training summary");
    let rows = summary
        .stages
        .iter()
        .map(|s| {
            vec![
                format!("{:?}", s.stage),
                s.epochs_run.to_string(),
                s.best_epoch.map(|e| e.to_string()).unwrap_or_else(|| "-".into()),
                fmt_opt(s.best_macro_auc, 4),
                if s.stopped_early { "yes" } else { "no" }.to_string(),
                s.optimizer_steps.to_string(),
                s.skipped_batches.to_string(),
            ]
        })
        .collect();
    print_table(
        &["Stage", "Epochs", "Best epoch", "Best macro AUC", "Early stop", "Steps", "Skipped"],
        rows,
    );
    if let Some(test) = &summary.test {
        print_metrics("Test split", test, labels.names());
    }
    print_success(&format!("Model saved to {}", dir.display()));
    print_hint("Next: affectus baselines --corpus <FILE.json>");
    Ok(())
}

/// Fine-tune `encoder` on the auxiliary corpus and save it under the warm-start dir.
fn warm_start_encoder(
    config: &Config,
    warm: &WarmStartConfig,
    encoder: Box<dyn TextEncoder>,
    collator: &Collator,
    device: &Device,
) -> Result<(Box<dyn TextEncoder>, StageReport)> {
    let raw = read_jsonl(&warm.dataset, IntensityTargets::Ignored)
        .with_context(|| format!("reading warm-start dataset {}", warm.dataset.display()))?;
    let labels = resolve_labels(&raw, warm.labels.as_deref())?;
    let examples = encode_examples(raw, &labels)?;
    let splits = split_dataset(examples, warm.validation_fraction, 0.0, warm.seed)?;
    info!(
        "Warm start: {} train / {} validation over {} auxiliary labels",
        splits.train.len(),
        splits.validation.len(),
        labels.len()
    );

    let pos_weight = pos_weights(&splits.train, labels.len(), warm.pos_weight_cap)?;
    let mut trainer =
        WarmStartTrainer::new(encoder, config.model.pooling, &pos_weight, warm, device)?;
    let report = trainer
        .run(collator, &splits.train, &splits.validation)?
        .clone();
    trainer.save(&config.paths.warm_start_dir(), &labels, collator)?;
    Ok((trainer.into_encoder(), report))
}

pub fn handle_evaluate(config: &Config, mode: OutputMode) -> Result<()> {
    let dir = config.paths.final_model_dir();
    let classifier = EmotionClassifier::load(&dir, &select_device())?;
    let labels = classifier.labels().clone();
    let splits = super::load_splits(config, &labels)?;
    let examples = if splits.test.is_empty() {
        info!("No test split configured; evaluating on the validation split");
        splits.validation
    } else {
        splits.test
    };

    let metrics = evaluate_examples(
        classifier.model(),
        classifier.collator(),
        &examples,
        config.evaluation.eval_batch_size,
        None,
    )?;
    let report = TestReport {
        metrics: &metrics,
        per_label: labels
            .names()
            .iter()
            .map(String::as_str)
            .zip(metrics.per_label_auc.iter().copied())
            .collect(),
        evaluated_at: Utc::now(),
    };
    let path = dir.join(TEST_METRICS_FILE);
    write_json_atomic(&path, &report)?;
    info!("Evaluation: {}", metrics.summary());

    if mode == OutputMode::Json {
        output_json(&report)?;
        return Ok(());
    }
    print_metrics("Evaluation", &metrics, labels.names());
    print_kv("written", &path.display().to_string());
    Ok(())
}
