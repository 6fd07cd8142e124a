//! Reference-corpus statistics of raw logits.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AffectError, Result};
use crate::labels::LabelSet;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub mean: f64,
    /// Sample standard deviation (N - 1); 0 for a single observation.
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl SummaryStats {
    pub fn from_values(values: &[f64]) -> Result<Self> {
        if values.is_empty() {
            return Err(AffectError::Data(
                "cannot summarize an empty set of values".into(),
            ));
        }
        if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(AffectError::Numerical(format!(
                "non-finite logit {} in reference corpus",
                bad
            )));
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let std = if values.len() > 1 {
            let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
            (ss / (n - 1.0)).sqrt()
        } else {
            0.0
        };
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Ok(Self {
            mean,
            std,
            min,
            max,
        })
    }

    /// `(value - mean) / std`, or 0 when the baseline has no spread.
    pub fn z_score(&self, value: f64) -> f64 {
        if self.std > 0.0 {
            (value - self.mean) / self.std
        } else {
            0.0
        }
    }
}

/// Per-label emotion baselines plus one intensity baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baselines {
    pub emotion: BTreeMap<String, SummaryStats>,
    pub intensity: SummaryStats,
}

impl Baselines {
    /// `emotion_logits[i][j]` is example `i`, label `j` in `labels` order.
    pub fn compute(
        emotion_logits: &[Vec<f32>],
        intensity_logits: &[f32],
        labels: &LabelSet,
    ) -> Result<Self> {
        if emotion_logits.is_empty() {
            return Err(AffectError::Data(
                "baseline corpus produced no logits".into(),
            ));
        }
        if intensity_logits.len() != emotion_logits.len() {
            return Err(AffectError::Data(format!(
                "{} intensity logits for {} examples",
                intensity_logits.len(),
                emotion_logits.len()
            )));
        }
        if let Some(row) = emotion_logits.iter().find(|r| r.len() != labels.len()) {
            return Err(AffectError::Data(format!(
                "logit row has {} entries, label set has {}",
                row.len(),
                labels.len()
            )));
        }

        let mut emotion = BTreeMap::new();
        for (j, name) in labels.names().iter().enumerate() {
            let column: Vec<f64> = emotion_logits.iter().map(|r| r[j] as f64).collect();
            emotion.insert(name.clone(), SummaryStats::from_values(&column)?);
        }
        let intensity: Vec<f64> = intensity_logits.iter().map(|&v| v as f64).collect();
        Ok(Self {
            emotion,
            intensity: SummaryStats::from_values(&intensity)?,
        })
    }

    pub fn for_label(&self, name: &str) -> Option<&SummaryStats> {
        self.emotion.get(name)
    }

    /// Stats in `labels` order.
    pub fn ordered(&self, labels: &LabelSet) -> Result<Vec<SummaryStats>> {
        labels
            .names()
            .iter()
            .map(|name| {
                self.emotion
                    .get(name)
                    .copied()
                    .ok_or_else(|| AffectError::Data(format!("no baseline for label '{}'", name)))
            })
            .collect()
    }

    pub(crate) fn check_labels(&self, labels: &LabelSet, path: &Path) -> Result<()> {
        let keys: Vec<&String> = self.emotion.keys().collect();
        let mut expected: Vec<&String> = labels.names().iter().collect();
        expected.sort();
        if keys != expected {
            return Err(AffectError::artifact(
                path,
                format!("baseline labels {:?} do not match manifest", keys),
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
    fn test_single_example_has_zero_std() {
        let b = Baselines::compute(&[vec![1.5, -0.5]], &[0.2], &labels()).unwrap();
        for stats in b.emotion.values() {
            assert_eq!(stats.std, 0.0);
            assert!(!stats.z_score(3.0).is_nan());
        }
        assert_eq!(b.intensity.std, 0.0);
        assert_eq!(b.for_label("joy").unwrap().min, 1.5);
        assert_eq!(b.for_label("joy").unwrap().max, 1.5);
    }

    #[test]
    fn test_sample_std() {
        let stats = SummaryStats::from_values(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert_eq!(stats.mean, 5.0);
        // population std is 2; sample std is sqrt(32/7)
        assert!((stats.std - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 9.0);
    }

    #[test]
    fn test_empty_and_mismatched_inputs() {
        assert!(matches!(
            Baselines::compute(&[], &[], &labels()),
            Err(AffectError::Data(_))
        ));
        assert!(Baselines::compute(&[vec![1.0]], &[0.0], &labels()).is_err());
        assert!(Baselines::compute(&[vec![1.0, 2.0]], &[], &labels()).is_err());
    }

    #[test]
    fn test_non_finite_logit_is_numerical_error() {
        let err = Baselines::compute(&[vec![f32::NAN, 0.0]], &[0.0], &labels()).unwrap_err();
        assert!(matches!(err, AffectError::Numerical(_)));
    }

    #[test]
    fn test_ordered_follows_label_set() {
        let b = Baselines::compute(&[vec![1.0, -1.0], vec![3.0, -3.0]], &[0.0, 1.0], &labels())
            .unwrap();
        let ordered = b.ordered(&labels()).unwrap();
        assert_eq!(ordered[0].mean, 2.0);
        assert_eq!(ordered[1].mean, -2.0);
    }

    #[test]
    fn test_check_labels_rejects_other_set() {
        let b = Baselines::compute(&[vec![1.0, 2.0]], &[0.0], &labels()).unwrap();
        let other = LabelSet::new(vec!["joy".into(), "anger".into()]).unwrap();
        assert!(b.check_labels(&labels(), Path::new("b.json")).is_ok());
        assert!(b.check_labels(&other, Path::new("b.json")).is_err());
    }
}
