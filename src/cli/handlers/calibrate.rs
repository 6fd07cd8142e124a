//! Calibration handlers: baselines, temperature, thresholds.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::warn;

use crate::calibration::{
    load_corpus, run_baselines, run_temperature, run_thresholds, CalibrationBundle,
};
use crate::classifier::EmotionClassifier;
use crate::cli::output::{
    output_json, print_header, print_kv, print_success, print_table, OutputMode,
};
use crate::config::Config;
use crate::encoder::select_device;

fn load_classifier(config: &Config) -> Result<EmotionClassifier> {
    let dir = config.paths.final_model_dir();
    let classifier = EmotionClassifier::load(&dir, &select_device())
        .with_context(|| format!("loading model snapshot from {}", dir.display()))?;
    Ok(classifier.with_batch_size(config.evaluation.eval_batch_size))
}

fn save_bundle(bundle: &CalibrationBundle, dir: &Path) -> Result<()> {
    bundle
        .save(dir)
        .with_context(|| format!("writing calibration artifacts to {}", dir.display()))
}

pub fn handle_baselines(config: &Config, corpus: &Path, mode: OutputMode) -> Result<()> {
    let texts = load_corpus(corpus)?;
    let classifier = load_classifier(config)?;
    let baselines = run_baselines(&classifier, &texts)?;

    let dir = config.paths.final_model_dir();
    let mut bundle = classifier.bundle().clone();
    if bundle.thresholds.take().is_some() {
        warn!("Dropped thresholds built on the previous baselines; rerun `affectus thresholds`");
    }
    bundle.baselines = Some(baselines.clone());
    save_bundle(&bundle, &dir)?;

    if mode == OutputMode::Json {
        output_json(&baselines)?;
        return Ok(());
    }
    print_header(&format!("Baselines over {} texts", texts.len()));
    let mut rows: Vec<Vec<String>> = classifier
        .labels()
        .names()
        .iter()
        .filter_map(|name| baselines.for_label(name).map(|s| (name, s)))
        .map(|(name, s)| {
            vec![
                name.clone(),
                format!("{:.4}", s.mean),
                format!("{:.4}", s.std),
                format!("{:.4}", s.min),
                format!("{:.4}", s.max),
            ]
        })
        .collect();
    let i = &baselines.intensity;
    rows.push(vec![
        "(intensity)".into(),
        format!("{:.4}", i.mean),
        format!("{:.4}", i.std),
        format!("{:.4}", i.min),
        format!("{:.4}", i.max),
    ]);
    print_table(&["Label", "Mean", "Std", "Min", "Max"], rows);
    print_success(&format!("Baselines written to {}", dir.display()));
    Ok(())
}

pub fn handle_temperature(config: &Config, mode: OutputMode) -> Result<()> {
    let classifier = load_classifier(config)?;
    let splits = super::load_splits(config, classifier.labels())?;
    let report = run_temperature(
        &classifier,
        &splits.validation,
        config.calibration.temperature_max_iter,
    )?;

    let dir = config.paths.final_model_dir();
    let mut bundle = classifier.bundle().clone();
    bundle.temperature = Some(report.params.clone());
    save_bundle(&bundle, &dir)?;

    if mode == OutputMode::Json {
        output_json(&report)?;
        return Ok(());
    }
    print_header(&format!(
        "Temperatures over {} validation examples",
        splits.validation.len()
    ));
    let rows = report
        .params
        .label_order
        .iter()
        .zip(&report.fits)
        .map(|(name, fit)| {
            vec![
                name.clone(),
                format!("{:.4}", fit.temperature),
                format!("{:.5}", fit.loss_before),
                format!("{:.5}", fit.loss_after),
                fit.iterations.to_string(),
                if fit.converged { "yes" } else { "no" }.to_string(),
            ]
        })
        .collect();
    print_table(
        &["Label", "T", "Loss before", "Loss after", "Iterations", "Converged"],
        rows,
    );
    print_success(&format!("Temperatures written to {}", dir.display()));
    Ok(())
}

/// Thresholds are derived on the validation split unless `corpus` is given.
pub fn handle_thresholds(config: &Config, corpus: Option<&Path>, mode: OutputMode) -> Result<()> {
    let classifier = load_classifier(config)?;
    let texts = match corpus {
        Some(path) => load_corpus(path)?,
        None => super::load_splits(config, classifier.labels())?
            .validation
            .into_iter()
            .map(|e| e.text)
            .collect(),
    };
    let thresholds = run_thresholds(&classifier, &texts, config.calibration.deviation)?;

    let dir = config.paths.final_model_dir();
    let mut bundle = classifier.bundle().clone();
    bundle.thresholds = Some(thresholds.clone());
    save_bundle(&bundle, &dir)?;

    if mode == OutputMode::Json {
        output_json(&thresholds)?;
        return Ok(());
    }
    print_header(&format!("Thresholds ({:?}) over {} texts", thresholds.deviation, texts.len()));
    let g = &thresholds.global;
    print_kv("global mean", &format!("{:.4}", g.mean));
    print_kv("global std", &format!("{:.4}", g.std));
    for (p, v) in &g.percentiles {
        print_kv(&format!("global p{}", p), &format!("{:.4}", v));
    }
    for (p, v) in &thresholds.intensity.percentiles {
        print_kv(&format!("intensity p{}", p), &format!("{:.4}", v));
    }
    println!();
    let rows = thresholds
        .per_emotion
        .iter()
        .map(|(name, d)| {
            vec![
                name.clone(),
                format!("{:.4}", d.mean),
                format!("{:.4}", d.std),
                format!("{:.4}", d.median),
                format!("{:.4}", d.p90),
            ]
        })
        .collect();
    print_table(&["Label", "Mean", "Std", "Median", "p90"], rows);
    print_success(&format!("Thresholds written to {}", dir.display()));
    Ok(())
}
