//! Distribution summaries of deviation-from-baseline scores.
//!
//! Deviation per (example, label) is either a z-score against the label's
//! baseline or a temperature-calibrated probability delta. Summaries use
//! population std and linearly interpolated percentiles.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::baselines::{Baselines, SummaryStats};
use super::temperature::TemperatureParams;
use crate::config::DeviationKind;
use crate::error::{AffectError, Result};
use crate::labels::LabelSet;

const GLOBAL_PERCENTILES: [u8; 4] = [75, 90, 95, 99];
const INTENSITY_PERCENTILES: [u8; 5] = [25, 75, 90, 95, 99];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    pub mean: f64,
    pub std: f64,
    pub median: f64,
    /// Keyed by percentile, e.g. `"95"`.
    pub percentiles: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelDistribution {
    pub mean: f64,
    pub std: f64,
    pub median: f64,
    #[serde(rename = "90th")]
    pub p90: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub global: Distribution,
    pub intensity: Distribution,
    pub per_emotion: BTreeMap<String, LabelDistribution>,
    #[serde(default)]
    pub deviation: DeviationKind,
}

/// Linear-interpolated percentile of an ascending slice, `p` in `[0, 100]`.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let rank = (p / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
        }
    }
}

fn sorted_copy(values: &[f64]) -> Vec<f64> {
    let mut v = values.to_vec();
    v.sort_by(f64::total_cmp);
    v
}

fn mean_and_population_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

impl Distribution {
    fn summarize(values: &[f64], percentiles: &[u8]) -> Self {
        let sorted = sorted_copy(values);
        let (mean, std) = mean_and_population_std(values);
        Self {
            mean,
            std,
            median: percentile(&sorted, 50.0),
            percentiles: percentiles
                .iter()
                .map(|&p| (p.to_string(), percentile(&sorted, p as f64)))
                .collect(),
        }
    }

    pub fn percentile(&self, p: u8) -> Option<f64> {
        self.percentiles.get(&p.to_string()).copied()
    }
}

impl LabelDistribution {
    fn summarize(values: &[f64]) -> Self {
        let sorted = sorted_copy(values);
        let (mean, std) = mean_and_population_std(values);
        Self {
            mean,
            std,
            median: percentile(&sorted, 50.0),
            p90: percentile(&sorted, 90.0),
        }
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Scores one logit against a label baseline.
#[derive(Debug, Clone)]
pub struct DeviationScorer {
    kind: DeviationKind,
    baselines: Vec<SummaryStats>,
    temperature: Option<Vec<f64>>,
}

impl DeviationScorer {
    pub fn new(
        kind: DeviationKind,
        baselines: &Baselines,
        temperature: Option<&TemperatureParams>,
        labels: &LabelSet,
    ) -> Result<Self> {
        let temperature = match (kind, temperature) {
            (DeviationKind::ProbabilityDelta, None) => {
                return Err(AffectError::Configuration(
                    "probability_delta deviation requires fitted temperatures".into(),
                ))
            }
            (_, Some(t)) => {
                t.check_labels(labels, Path::new(super::artifacts::TEMPERATURE_FILE))?;
                Some(t.temperature.clone())
            }
            (_, None) => None,
        };
        Ok(Self {
            kind,
            baselines: baselines.ordered(labels)?,
            temperature,
        })
    }

    pub fn score(&self, label_idx: usize, logit: f64) -> f64 {
        let base = &self.baselines[label_idx];
        match self.kind {
            DeviationKind::ZScore => base.z_score(logit),
            DeviationKind::ProbabilityDelta => {
                let t = self
                    .temperature
                    .as_ref()
                    .and_then(|t| t.get(label_idx).copied())
                    .unwrap_or(1.0);
                sigmoid(logit / t) - sigmoid(base.mean / t)
            }
        }
    }
}

impl Thresholds {
    /// Summarize deviations of a reference corpus against `baselines`.
    pub fn derive(
        emotion_logits: &[Vec<f32>],
        intensity_logits: &[f32],
        labels: &LabelSet,
        baselines: &Baselines,
        deviation: DeviationKind,
        temperature: Option<&TemperatureParams>,
    ) -> Result<Self> {
        if emotion_logits.is_empty() {
            return Err(AffectError::Data(
                "threshold corpus produced no logits".into(),
            ));
        }
        if intensity_logits.len() != emotion_logits.len() {
            return Err(AffectError::Data(format!(
                "{} intensity logits for {} examples",
                intensity_logits.len(),
                emotion_logits.len()
            )));
        }
        if emotion_logits.iter().any(|r| r.len() != labels.len()) {
            return Err(AffectError::Data(format!(
                "logit rows must have {} entries",
                labels.len()
            )));
        }
        let scorer = DeviationScorer::new(deviation, baselines, temperature, labels)?;

        let mut all = Vec::with_capacity(emotion_logits.len() * labels.len());
        let mut by_label: Vec<Vec<f64>> =
            vec![Vec::with_capacity(emotion_logits.len()); labels.len()];
        for row in emotion_logits {
            for (j, &logit) in row.iter().enumerate() {
                let d = scorer.score(j, logit as f64);
                all.push(d);
                by_label[j].push(d);
            }
        }
        if let Some(bad) = all.iter().find(|d| !d.is_finite()) {
            return Err(AffectError::Numerical(format!(
                "non-finite deviation score {}",
                bad
            )));
        }
        let intensity: Vec<f64> = intensity_logits
            .iter()
            .map(|&v| baselines.intensity.z_score(v as f64))
            .collect();

        Ok(Self {
            global: Distribution::summarize(&all, &GLOBAL_PERCENTILES),
            intensity: Distribution::summarize(&intensity, &INTENSITY_PERCENTILES),
            per_emotion: labels
                .names()
                .iter()
                .zip(&by_label)
                .map(|(name, values)| (name.clone(), LabelDistribution::summarize(values)))
                .collect(),
            deviation,
        })
    }

    pub(crate) fn check_labels(&self, labels: &LabelSet, path: &Path) -> Result<()> {
        let keys: Vec<&String> = self.per_emotion.keys().collect();
        let mut expected: Vec<&String> = labels.names().iter().collect();
        expected.sort();
        if keys != expected {
            return Err(AffectError::artifact(
                path,
                format!("threshold labels {:?} do not match manifest", keys),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> LabelSet {
        LabelSet::new(vec!["joy".into(), "fear".into()]).unwrap()
    }

    #[test]
    fn test_percentile_matches_linear_interpolation() {
        let v = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&v, 50.0), 3.0);
        assert_eq!(percentile(&v, 75.0), 4.0);
        assert!((percentile(&v, 90.0) - 4.6).abs() < 1e-12);
        assert_eq!(percentile(&[7.0], 99.0), 7.0);
        assert_eq!(percentile(&[1.0, 2.0], 50.0), 1.5);
    }

    #[test]
    fn test_zero_std_baseline_gives_zero_deviation() {
        let baselines = Baselines::compute(&[vec![1.0, 2.0]], &[0.5], &labels()).unwrap();
        let t = Thresholds::derive(
            &[vec![5.0, -3.0], vec![0.0, 0.0]],
            &[1.0, 2.0],
            &labels(),
            &baselines,
            DeviationKind::ZScore,
            None,
        )
        .unwrap();
        assert_eq!(t.global.mean, 0.0);
        assert_eq!(t.global.std, 0.0);
        assert_eq!(t.intensity.median, 0.0);
        assert!(t.global.percentiles.values().all(|v| *v == 0.0));
    }

    #[test]
    fn test_z_score_summaries() {
        let logits = vec![vec![0.0, 10.0], vec![2.0, 10.0], vec![4.0, 10.0]];
        let intensity = vec![0.0, 1.0, 2.0];
        let baselines = Baselines::compute(&logits, &intensity, &labels()).unwrap();
        let t = Thresholds::derive(
            &logits,
            &intensity,
            &labels(),
            &baselines,
            DeviationKind::ZScore,
            None,
        )
        .unwrap();

        // joy: mean 2, sample std 2 => z = [-1, 0, 1]; fear has no spread => 0
        let joy = &t.per_emotion["joy"];
        assert!((joy.mean).abs() < 1e-12);
        assert!((joy.std - (2.0f64 / 3.0).sqrt()).abs() < 1e-12);
        assert_eq!(joy.median, 0.0);
        assert!((joy.p90 - 0.8).abs() < 1e-12);
        assert_eq!(t.per_emotion["fear"].std, 0.0);

        assert_eq!(
            t.global.percentiles.keys().collect::<Vec<_>>(),
            vec!["75", "90", "95", "99"]
        );
        assert_eq!(t.intensity.percentiles.len(), 5);
        assert!(t.intensity.percentile(25).is_some());
    }

    #[test]
    fn test_probability_delta_requires_temperature() {
        let baselines = Baselines::compute(&[vec![0.0, 0.0]], &[0.0], &labels()).unwrap();
        let err = Thresholds::derive(
            &[vec![1.0, 1.0]],
            &[0.0],
            &labels(),
            &baselines,
            DeviationKind::ProbabilityDelta,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, AffectError::Configuration(_)));

        let temperature = TemperatureParams {
            temperature: vec![2.0, 1.0],
            label_order: vec!["joy".into(), "fear".into()],
        };
        let t = Thresholds::derive(
            &[vec![2.0, 0.0]],
            &[0.0],
            &labels(),
            &baselines,
            DeviationKind::ProbabilityDelta,
            Some(&temperature),
        )
        .unwrap();
        let expected = 1.0 / (1.0 + (-1.0f64).exp()) - 0.5;
        assert!((t.per_emotion["joy"].mean - expected).abs() < 1e-12);
        assert_eq!(t.per_emotion["fear"].mean, 0.0);
        assert_eq!(t.deviation, DeviationKind::ProbabilityDelta);
    }

    #[test]
    fn test_serialized_layout() {
        let logits = vec![vec![0.0, 1.0], vec![1.0, 0.0]];
        let baselines = Baselines::compute(&logits, &[0.0, 1.0], &labels()).unwrap();
        let t = Thresholds::derive(
            &logits,
            &[0.0, 1.0],
            &labels(),
            &baselines,
            DeviationKind::ZScore,
            None,
        )
        .unwrap();
        let json = serde_json::to_value(&t).unwrap();
        assert!(json["global"]["percentiles"]["99"].is_number());
        assert!(json["intensity"]["percentiles"]["25"].is_number());
        assert!(json["per_emotion"]["joy"]["90th"].is_number());
        assert_eq!(json["deviation"], "z_score");
    }
}
