//! Calibrated inference over a finalized model snapshot.
//!
//! [`EmotionClassifier`] is the synchronous core: it loads weights, tokenizer,
//! label manifest and whatever calibration artifacts exist, and turns texts
//! into logits or scored predictions. [`ClassifierService`] wraps it for async
//! callers the same way the rest of the crate wraps blocking candle work.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::calibration::{CalibrationBundle, DeviationScorer};
use crate::config::DeviationKind;
use crate::data::Collator;
use crate::error::{AffectError, Result};
use crate::labels::LabelSet;
use crate::model::{DualHeadModel, WEIGHTS_FILE};
use crate::trainer::TOKENIZER_FILE;

const DEFAULT_MAX_LENGTH: usize = 512;
const DEFAULT_BATCH_SIZE: usize = 32;

/// Uncalibrated head outputs, one row per input text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawLogits {
    /// `[N][L]` in label-manifest order.
    pub emotion: Vec<Vec<f32>>,
    pub intensity: Vec<f32>,
}

impl RawLogits {
    pub fn len(&self) -> usize {
        self.emotion.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emotion.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelScore {
    pub label: String,
    pub score: f32,
    /// Deviation from the label's baseline, when baselines are loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deviation: Option<f64>,
    /// Deviation above the label's 90th percentile, when thresholds are loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notable: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRollup {
    pub primary: String,
    pub scores: BTreeMap<String, f32>,
}

/// Scored output for one text. `scores` is sorted by descending score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub text: String,
    pub dominant: String,
    pub confidence: f32,
    pub scores: Vec<LabelScore>,
    pub intensity: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intensity_z: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<CategoryRollup>,
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Deviation mode follows the thresholds artifact, z-scores otherwise.
fn build_scorer(bundle: &CalibrationBundle) -> Result<Option<DeviationScorer>> {
    let Some(baselines) = &bundle.baselines else {
        return Ok(None);
    };
    let kind = bundle
        .thresholds
        .as_ref()
        .map(|t| t.deviation)
        .unwrap_or(DeviationKind::ZScore);
    DeviationScorer::new(kind, baselines, bundle.temperature.as_ref(), &bundle.labels).map(Some)
}

/// Loaded snapshot plus calibration, ready to score texts.
pub struct EmotionClassifier {
    model: DualHeadModel,
    collator: Collator,
    bundle: CalibrationBundle,
    scorer: Option<DeviationScorer>,
    categories: BTreeMap<String, Vec<usize>>,
    batch_size: usize,
}

impl EmotionClassifier {
    /// Load the snapshot written by `TwoPhaseTrainer::finalize` from `dir`.
    pub fn load(dir: &Path, device: &Device) -> Result<Self> {
        if !dir.join(WEIGHTS_FILE).exists() {
            return Err(AffectError::ModelNotReady(format!(
                "no trained model at {}; run `affectus train` first",
                dir.display()
            )));
        }
        let bundle = CalibrationBundle::load(dir)?;
        let model = DualHeadModel::load(dir, device)?;
        if model.num_labels() != bundle.labels.len() {
            return Err(AffectError::artifact(
                dir.join(WEIGHTS_FILE),
                format!(
                    "model has {} outputs but the manifest lists {} labels",
                    model.num_labels(),
                    bundle.labels.len()
                ),
            ));
        }

        let tokenizer_path = dir.join(TOKENIZER_FILE);
        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            AffectError::artifact(&tokenizer_path, format!("failed to load tokenizer: {}", e))
        })?;
        let max_length = tokenizer
            .get_truncation()
            .map(|t| t.max_length)
            .unwrap_or(DEFAULT_MAX_LENGTH);
        let collator = Collator::new(tokenizer, max_length, device.clone())?;

        info!(
            "Loaded classifier from {} ({} labels, max_length {})",
            dir.display(),
            bundle.labels.len(),
            max_length
        );
        Ok(Self {
            scorer: build_scorer(&bundle)?,
            model,
            collator,
            bundle,
            categories: BTreeMap::new(),
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    /// Roll fine labels up into `categories` (parent -> member labels).
    pub fn with_categories(mut self, categories: &BTreeMap<String, Vec<String>>) -> Result<Self> {
        let mut resolved = BTreeMap::new();
        for (parent, members) in categories {
            let indices = members
                .iter()
                .map(|m| {
                    self.bundle.labels.index_of(m).ok_or_else(|| {
                        AffectError::Configuration(format!(
                            "category '{}' names unknown label '{}'",
                            parent, m
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            resolved.insert(parent.clone(), indices);
        }
        self.categories = resolved;
        Ok(self)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn labels(&self) -> &LabelSet {
        &self.bundle.labels
    }

    pub fn bundle(&self) -> &CalibrationBundle {
        &self.bundle
    }

    pub fn model(&self) -> &DualHeadModel {
        &self.model
    }

    pub fn collator(&self) -> &Collator {
        &self.collator
    }

    /// Swap in freshly fitted calibration artifacts.
    pub fn set_bundle(&mut self, bundle: CalibrationBundle) -> Result<()> {
        if bundle.labels.len() != self.model.num_labels() {
            return Err(AffectError::Configuration(format!(
                "bundle has {} labels, model has {} outputs",
                bundle.labels.len(),
                self.model.num_labels()
            )));
        }
        self.scorer = build_scorer(&bundle)?;
        self.bundle = bundle;
        Ok(())
    }

    /// Raw head outputs for `texts`, batched.
    pub fn predict_logits(&self, texts: &[&str]) -> Result<RawLogits> {
        let mut out = RawLogits::default();
        for chunk in texts.chunks(self.batch_size) {
            let (ids, mask) = self.collator.encode_texts(chunk)?;
            let output = self.model.forward(&ids, &mask)?;
            out.emotion.extend(output.emotion_logits.to_vec2::<f32>()?);
            out.intensity
                .extend(output.intensity_logit.flatten_all()?.to_vec1::<f32>()?);
            debug!("Scored batch of {}", chunk.len());
        }
        Ok(out)
    }

    /// Scored predictions. Probabilities are temperature-scaled when a
    /// temperature artifact is loaded, plain sigmoid otherwise.
    pub fn predict(&self, texts: &[&str]) -> Result<Vec<Prediction>> {
        let raw = self.predict_logits(texts)?;
        Ok(texts
            .iter()
            .zip(raw.emotion.iter().zip(&raw.intensity))
            .map(|(text, (row, &intensity))| self.to_prediction(text, row, intensity))
            .collect())
    }

    fn to_prediction(&self, text: &str, row: &[f32], intensity: f32) -> Prediction {
        let names = self.bundle.labels.names();
        let probs: Vec<f32> = row
            .iter()
            .enumerate()
            .map(|(j, &logit)| {
                let z = match &self.bundle.temperature {
                    Some(t) => t.apply(j, logit as f64),
                    None => logit as f64,
                };
                sigmoid(z) as f32
            })
            .collect();

        let mut scores: Vec<LabelScore> = names
            .iter()
            .enumerate()
            .map(|(j, name)| {
                let deviation = self.scorer.as_ref().map(|s| s.score(j, row[j] as f64));
                let notable = match (deviation, &self.bundle.thresholds) {
                    (Some(d), Some(t)) => t.per_emotion.get(name).map(|dist| d > dist.p90),
                    _ => None,
                };
                LabelScore {
                    label: name.clone(),
                    score: probs[j],
                    deviation,
                    notable,
                }
            })
            .collect();
        scores.sort_by(|a, b| b.score.total_cmp(&a.score));

        let (dominant, confidence) = scores
            .first()
            .map(|s| (s.label.clone(), s.score))
            .unwrap_or_default();

        let category = if self.categories.is_empty() {
            None
        } else {
            let sums: BTreeMap<String, f32> = self
                .categories
                .iter()
                .map(|(parent, members)| (parent.clone(), members.iter().map(|&j| probs[j]).sum()))
                .collect();
            sums.iter()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(primary, _)| primary.clone())
                .map(|primary| CategoryRollup {
                    primary,
                    scores: sums,
                })
        };

        Prediction {
            text: text.to_string(),
            dominant,
            confidence,
            scores,
            intensity,
            intensity_z: self
                .bundle
                .baselines
                .as_ref()
                .map(|b| b.intensity.z_score(intensity as f64)),
            category,
        }
    }
}

/// Async boundary for callers that must not block on model execution.
#[async_trait]
pub trait ClassifierService: Send + Sync {
    async fn predict(&self, texts: Vec<String>) -> Result<Vec<Prediction>>;

    fn labels(&self) -> Result<Vec<String>>;

    fn is_ready(&self) -> bool;
}

/// A blocking worker that panicked or was cancelled. Never retryable.
fn task_failed(what: &str, err: tokio::task::JoinError) -> AffectError {
    AffectError::Inference(format!("{} task failed: {}", what, err))
}

/// Serves a locally loaded [`EmotionClassifier`] on the blocking pool.
pub struct LocalClassifierService {
    classifier: RwLock<Option<Arc<EmotionClassifier>>>,
}

impl Default for LocalClassifierService {
    fn default() -> Self {
        Self::unloaded()
    }
}

impl LocalClassifierService {
    pub fn unloaded() -> Self {
        Self {
            classifier: RwLock::new(None),
        }
    }

    pub fn new(classifier: EmotionClassifier) -> Self {
        Self {
            classifier: RwLock::new(Some(Arc::new(classifier))),
        }
    }

    /// Load (or replace) the served snapshot from `dir`.
    pub async fn load(&self, dir: &Path, device: Device) -> Result<()> {
        let dir = dir.to_path_buf();
        let classifier = tokio::task::spawn_blocking(move || EmotionClassifier::load(&dir, &device))
            .await
            .map_err(|e| task_failed("loader", e))??;
        self.install(classifier);
        Ok(())
    }

    pub fn install(&self, classifier: EmotionClassifier) {
        let mut slot = match self.classifier.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(Arc::new(classifier));
    }

    fn current(&self) -> Result<Arc<EmotionClassifier>> {
        let slot = match self.classifier.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.clone()
            .ok_or_else(|| AffectError::ModelNotReady("no classifier snapshot loaded".into()))
    }
}

#[async_trait]
impl ClassifierService for LocalClassifierService {
    async fn predict(&self, texts: Vec<String>) -> Result<Vec<Prediction>> {
        let classifier = self.current()?;
        tokio::task::spawn_blocking(move || {
            let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
            classifier.predict(&refs)
        })
        .await
        .map_err(|e| task_failed("inference", e))?
    }

    fn labels(&self) -> Result<Vec<String>> {
        Ok(self.current()?.labels().names().to_vec())
    }

    fn is_ready(&self) -> bool {
        self.current().is_ok()
    }
}

/// Stand-in when no model is configured. Never ready.
pub struct NoopClassifierService;

impl Default for NoopClassifierService {
    fn default() -> Self {
        Self::new()
    }
}

impl NoopClassifierService {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ClassifierService for NoopClassifierService {
    async fn predict(&self, _texts: Vec<String>) -> Result<Vec<Prediction>> {
        Err(AffectError::ModelNotReady(
            "classifier service is disabled".into(),
        ))
    }

    fn labels(&self) -> Result<Vec<String>> {
        Err(AffectError::ModelNotReady(
            "classifier service is disabled".into(),
        ))
    }

    fn is_ready(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{Baselines, TemperatureParams};
    use crate::encoder::TokenEmbeddingEncoder;
    use crate::model::Pooling;
    use crate::testing::word_level_tokenizer;

    fn snapshot(dir: &Path) -> LabelSet {
        let device = Device::Cpu;
        let encoder = TokenEmbeddingEncoder::new(32, 8, &device).unwrap();
        let model =
            DualHeadModel::new(Box::new(encoder), 2, Pooling::Mean, None, &device).unwrap();
        model.save(dir).unwrap();
        let labels = LabelSet::new(vec!["joy".into(), "fear".into()]).unwrap();
        labels.save(dir).unwrap();
        let collator = Collator::new(word_level_tokenizer(), 16, device).unwrap();
        collator
            .tokenizer()
            .save(dir.join(TOKENIZER_FILE), false)
            .unwrap();
        labels
    }

    #[test]
    fn test_missing_snapshot_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let err = EmotionClassifier::load(dir.path(), &Device::Cpu)
            .err()
            .unwrap();
        assert!(matches!(err, AffectError::ModelNotReady(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_predict_scores_sorted_and_dominant() {
        let dir = tempfile::tempdir().unwrap();
        snapshot(dir.path());
        let classifier = EmotionClassifier::load(dir.path(), &Device::Cpu).unwrap();

        let preds = classifier
            .predict(&["so happy today", "scared of the dark", "quiet"])
            .unwrap();
        assert_eq!(preds.len(), 3);
        for p in &preds {
            assert_eq!(p.scores.len(), 2);
            assert!(p.scores[0].score >= p.scores[1].score);
            assert_eq!(p.dominant, p.scores[0].label);
            assert_eq!(p.confidence, p.scores[0].score);
            assert!(p.scores.iter().all(|s| (0.0..=1.0).contains(&s.score)));
            assert!(p.scores.iter().all(|s| s.deviation.is_none()));
            assert!(p.category.is_none());
        }
        assert_eq!(preds[1].text, "scared of the dark");
    }

    #[test]
    fn test_predict_logits_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        snapshot(dir.path());
        let classifier = EmotionClassifier::load(dir.path(), &Device::Cpu).unwrap();
        assert!(classifier.predict_logits(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_temperature_changes_probabilities() {
        let dir = tempfile::tempdir().unwrap();
        let labels = snapshot(dir.path());
        let mut classifier = EmotionClassifier::load(dir.path(), &Device::Cpu).unwrap();
        let raw = classifier.predict_logits(&["so happy today"]).unwrap();

        let mut bundle = CalibrationBundle::new(labels.clone());
        bundle.temperature = Some(TemperatureParams {
            temperature: vec![2.0, 0.5],
            label_order: labels.names().to_vec(),
        });
        classifier.set_bundle(bundle).unwrap();
        let pred = &classifier.predict(&["so happy today"]).unwrap()[0];

        for (j, name) in labels.names().iter().enumerate() {
            let t = [2.0, 0.5][j];
            let expected = sigmoid(raw.emotion[0][j] as f64 / t) as f32;
            let got = pred.scores.iter().find(|s| &s.label == name).unwrap().score;
            assert!((got - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_baselines_add_deviation_and_categories_roll_up() {
        let dir = tempfile::tempdir().unwrap();
        let labels = snapshot(dir.path());
        let mut bundle = CalibrationBundle::new(labels.clone());
        let logits = [vec![0.0, 0.0], vec![1.0, -1.0]];
        bundle.baselines = Some(Baselines::compute(&logits, &[0.0, 1.0], &labels).unwrap());
        bundle.save(dir.path()).unwrap();

        let categories = BTreeMap::from([
            ("positive".to_string(), vec!["joy".to_string()]),
            ("negative".to_string(), vec!["fear".to_string()]),
        ]);
        let classifier = EmotionClassifier::load(dir.path(), &Device::Cpu)
            .unwrap()
            .with_categories(&categories)
            .unwrap();
        let pred = &classifier.predict(&["glad and joyful"]).unwrap()[0];

        assert!(pred.scores.iter().all(|s| s.deviation.is_some()));
        assert!(pred.intensity_z.is_some());
        let rollup = pred.category.as_ref().unwrap();
        let joy = pred.scores.iter().find(|s| s.label == "joy").unwrap().score;
        assert_eq!(rollup.scores["positive"], joy);
        let expected_primary = if joy >= rollup.scores["negative"] {
            "positive"
        } else {
            "negative"
        };
        assert_eq!(rollup.primary, expected_primary);
    }

    #[test]
    fn test_unknown_category_member_rejected() {
        let dir = tempfile::tempdir().unwrap();
        snapshot(dir.path());
        let categories = BTreeMap::from([("x".to_string(), vec!["anger".to_string()])]);
        let result = EmotionClassifier::load(dir.path(), &Device::Cpu)
            .unwrap()
            .with_categories(&categories);
        assert!(matches!(result, Err(AffectError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_local_service_lifecycle() {
        let service = LocalClassifierService::unloaded();
        assert!(!service.is_ready());
        assert!(matches!(
            service.predict(vec!["hi".into()]).await,
            Err(AffectError::ModelNotReady(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        snapshot(dir.path());
        service.load(dir.path(), Device::Cpu).await.unwrap();
        assert!(service.is_ready());
        assert_eq!(service.labels().unwrap(), vec!["joy", "fear"]);
        let preds = service
            .predict(vec!["happy".into(), "afraid".into()])
            .await
            .unwrap();
        assert_eq!(preds.len(), 2);
    }

    #[tokio::test]
    async fn test_panicked_worker_is_a_failed_prediction_not_unready() {
        let join_err = tokio::task::spawn_blocking(|| panic!("forward pass blew up"))
            .await
            .unwrap_err();
        let err = task_failed("inference", join_err);
        assert!(matches!(err, AffectError::Inference(_)));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("inference task failed"));
    }

    #[tokio::test]
    async fn test_noop_service_never_ready() {
        let service = NoopClassifierService::new();
        assert!(!service.is_ready());
        assert!(service.labels().is_err());
        assert!(service.predict(vec![]).await.is_err());
    }
}
