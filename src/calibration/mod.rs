//! Post-training calibration: baselines, temperatures and deviation thresholds.
//!
//! Each step runs the finalized classifier over a reference set and writes one
//! artifact next to the weights. Order matters: thresholds are expressed as
//! deviations from baselines, and probability-delta thresholds also need the
//! fitted temperatures.

pub mod artifacts;
pub mod baselines;
pub mod temperature;
pub mod thresholds;

use std::path::Path;

use tracing::info;

pub use artifacts::{
    CalibrationBundle, BASELINES_FILE, CALIBRATION_FILES, TEMPERATURE_FILE, THRESHOLDS_FILE,
};
pub use baselines::{Baselines, SummaryStats};
pub use temperature::{fit_temperature, LabelFit, TemperatureParams, TemperatureReport};
pub use thresholds::{DeviationScorer, Distribution, LabelDistribution, Thresholds};

use crate::classifier::EmotionClassifier;
use crate::config::DeviationKind;
use crate::data::Example;
use crate::error::{AffectError, Result};

/// Read a reference corpus: a JSON array of strings.
pub fn load_corpus(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| AffectError::Data(format!("failed to read {}: {}", path.display(), e)))?;
    let value: serde_json::Value = serde_json::from_str(&contents)
        .map_err(|e| AffectError::Data(format!("{} is not valid JSON: {}", path.display(), e)))?;
    let items = value.as_array().ok_or_else(|| {
        AffectError::Data(format!("{} must contain a JSON list of strings", path.display()))
    })?;
    let texts = items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            item.as_str().map(str::to_string).ok_or_else(|| {
                AffectError::Data(format!("{}: entry {} is not a string", path.display(), i))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    if texts.is_empty() {
        return Err(AffectError::Data(format!(
            "{} contains no texts",
            path.display()
        )));
    }
    Ok(texts)
}

fn as_refs(texts: &[String]) -> Vec<&str> {
    texts.iter().map(String::as_str).collect()
}

/// Baselines of the classifier's raw logits over `texts`.
pub fn run_baselines(classifier: &EmotionClassifier, texts: &[String]) -> Result<Baselines> {
    if texts.is_empty() {
        return Err(AffectError::Data("baseline corpus is empty".into()));
    }
    let raw = classifier.predict_logits(&as_refs(texts))?;
    let baselines = Baselines::compute(&raw.emotion, &raw.intensity, classifier.labels())?;
    info!("Computed baselines over {} texts", texts.len());
    Ok(baselines)
}

/// Fit per-label temperatures on held-out labelled examples.
pub fn run_temperature(
    classifier: &EmotionClassifier,
    examples: &[Example],
    max_iter: usize,
) -> Result<TemperatureReport> {
    if examples.is_empty() {
        return Err(AffectError::Data(
            "temperature fitting needs a non-empty validation split".into(),
        ));
    }
    let texts: Vec<&str> = examples.iter().map(|e| e.text.as_str()).collect();
    let raw = classifier.predict_logits(&texts)?;
    let targets: Vec<Vec<f32>> = examples.iter().map(|e| e.labels.clone()).collect();
    let report = fit_temperature(&raw.emotion, &targets, classifier.labels(), max_iter)?;
    info!(
        "Fitted temperatures on {} examples ({} of {} labels converged)",
        examples.len(),
        report.fits.iter().filter(|f| f.converged).count(),
        report.fits.len()
    );
    Ok(report)
}

/// Deviation summaries over `texts`, using the classifier's loaded baselines
/// (and temperatures for [`DeviationKind::ProbabilityDelta`]).
pub fn run_thresholds(
    classifier: &EmotionClassifier,
    texts: &[String],
    deviation: DeviationKind,
) -> Result<Thresholds> {
    let bundle = classifier.bundle();
    let baselines = bundle.baselines.as_ref().ok_or_else(|| {
        AffectError::artifact(
            BASELINES_FILE,
            "baselines are required before deriving thresholds; run `affectus baselines` first",
        )
    })?;
    if texts.is_empty() {
        return Err(AffectError::Data("threshold corpus is empty".into()));
    }
    let raw = classifier.predict_logits(&as_refs(texts))?;
    let thresholds = Thresholds::derive(
        &raw.emotion,
        &raw.intensity,
        classifier.labels(),
        baselines,
        deviation,
        bundle.temperature.as_ref(),
    )?;
    info!(
        "Derived {:?} thresholds over {} texts (global p95 {:.3})",
        deviation,
        texts.len(),
        thresholds.global.percentile(95).unwrap_or(f64::NAN)
    );
    Ok(thresholds)
}
