//! Composite training objective.
//!
//! Three terms:
//! 1. Positive-weighted multi-label BCE over emotion logits
//! 2. Neutral-aware intensity loss (L1 on expressive rows, dead-zone hinge on neutral-like rows)
//! 3. Multi-Similarity metric loss over emotion features of non-neutral rows
//!
//! `total = emotion + w_intensity * intensity + w_metric * metric`
//!
//! [`WeightedBceLoss`] keeps only the first term, for the encoder warm start.

use candle_core::{DType, Device, Tensor, D};

use crate::config::LossConfig;
use crate::data::{Batch, Example};
use crate::error::{AffectError, Result};
use crate::miner::{MultiLabelPairMiner, PairMiner};
use crate::model::ModelOutput;

const POS_WEIGHT_EPS: f32 = 1e-5;
const NORM_EPS: f64 = 1e-12;

/// Per-component loss values for logging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossComponents {
    pub emotion: f32,
    /// `expressive + neutral_weight * neutral`.
    pub intensity: f32,
    pub expressive: f32,
    pub neutral: f32,
    pub metric: f32,
    pub total: f32,
    pub expressive_rows: usize,
    pub neutral_rows: usize,
    pub metric_pairs: usize,
}

/// Training objective injected into the trainer.
pub trait LossFunction: Send + Sync {
    /// Differentiable scalar loss plus host-side component values.
    fn compute(&self, output: &ModelOutput, batch: &Batch) -> Result<(Tensor, LossComponents)>;
}

/// Per-label `neg / (pos + eps)`, capped at `cap`.
pub fn pos_weights(examples: &[Example], num_labels: usize, cap: f32) -> Result<Vec<f32>> {
    if examples.is_empty() {
        return Err(AffectError::Data(
            "cannot compute positive weights from an empty set".into(),
        ));
    }
    let mut positives = vec![0usize; num_labels];
    for example in examples {
        if example.labels.len() != num_labels {
            return Err(AffectError::Data(format!(
                "example has {} labels, expected {}",
                example.labels.len(),
                num_labels
            )));
        }
        for (count, &v) in positives.iter_mut().zip(&example.labels) {
            if v > 0.5 {
                *count += 1;
            }
        }
    }
    let n = examples.len();
    Ok(positives
        .into_iter()
        .map(|pos| {
            let neg = (n - pos) as f32;
            (neg / (pos as f32 + POS_WEIGHT_EPS)).min(cap)
        })
        .collect())
}

/// Numerically stable `ln(1 + e^x)`.
fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    Ok((x.relu()? + tail)?)
}

fn scalar(value: f32, device: &Device) -> Result<Tensor> {
    Ok(Tensor::new(value, device)?)
}

/// Weighted BCE-with-logits averaged over rows and labels.
///
/// `l = pw * y * softplus(-x) + (1 - y) * softplus(x)`
fn weighted_bce(logits: &Tensor, targets: &Tensor, pos_weight: &Tensor) -> Result<Tensor> {
    let sp_pos = softplus(logits)?;
    let sp_neg = (&sp_pos - logits)?;
    let positive = targets.broadcast_mul(pos_weight)?.mul(&sp_neg)?;
    let negative = targets.affine(-1.0, 1.0)?.mul(&sp_pos)?;
    Ok((positive + negative)?.mean_all()?)
}

fn pos_weight_tensor(pos_weight: &[f32], device: &Device) -> Result<Tensor> {
    if pos_weight.is_empty() {
        return Err(AffectError::Configuration(
            "positive weights must cover at least one label".into(),
        ));
    }
    Ok(Tensor::from_slice(pos_weight, pos_weight.len(), device)?)
}

/// Emotion BCE alone. Intensity targets and features are ignored.
pub struct WeightedBceLoss {
    pos_weight: Tensor,
}

impl WeightedBceLoss {
    pub fn new(pos_weight: &[f32], device: &Device) -> Result<Self> {
        Ok(Self {
            pos_weight: pos_weight_tensor(pos_weight, device)?,
        })
    }
}

impl LossFunction for WeightedBceLoss {
    fn compute(&self, output: &ModelOutput, batch: &Batch) -> Result<(Tensor, LossComponents)> {
        if batch.is_empty() {
            let zero = scalar(0.0, output.emotion_logits.device())?;
            return Ok((zero, LossComponents::default()));
        }
        let labels = batch.labels.to_dtype(DType::F32)?;
        let loss = weighted_bce(&output.emotion_logits, &labels, &self.pos_weight)?;
        let value = loss.to_scalar::<f32>()?;
        let components = LossComponents {
            emotion: value,
            total: value,
            ..Default::default()
        };
        Ok((loss, components))
    }
}

pub struct CompositeLoss {
    pos_weight: Tensor,
    config: LossConfig,
    intensity_weight: f32,
    metric_weight: f32,
    miner: Box<dyn PairMiner>,
}

impl CompositeLoss {
    pub fn new(
        pos_weight: &[f32],
        config: LossConfig,
        intensity_weight: f32,
        metric_weight: f32,
        device: &Device,
    ) -> Result<Self> {
        let miner = Box::new(MultiLabelPairMiner::new(config.overlap_threshold));
        Ok(Self {
            pos_weight: pos_weight_tensor(pos_weight, device)?,
            config,
            intensity_weight,
            metric_weight,
            miner,
        })
    }

    pub fn with_miner(mut self, miner: Box<dyn PairMiner>) -> Self {
        self.miner = miner;
        self
    }

    pub fn emotion_loss(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
        weighted_bce(logits, targets, &self.pos_weight)
    }

    /// Returns `(expressive_loss, neutral_loss, expressive_rows, neutral_rows)`.
    pub fn intensity_terms(
        &self,
        emotion_logits: &Tensor,
        intensity_logit: &Tensor,
        batch: &Batch,
    ) -> Result<(Tensor, Tensor, usize, usize)> {
        let device = intensity_logit.device();
        let pred = intensity_logit.flatten_all()?;
        let n = pred.dim(0)?;

        let max_prob = candle_nn::ops::sigmoid(&emotion_logits.detach())?
            .max(D::Minus1)?
            .to_vec1::<f32>()?;
        let active = batch.labels.max(D::Minus1)?.to_vec1::<f32>()?;

        let mut expressive = vec![0f32; n];
        let mut neutral = vec![0f32; n];
        for i in 0..n {
            if active[i] > 0.5 && max_prob[i] >= self.config.confidence_floor {
                expressive[i] = 1.0;
            } else {
                neutral[i] = 1.0;
            }
        }
        let n_expr = expressive.iter().filter(|&&v| v > 0.0).count();
        let n_neut = n - n_expr;

        let expressive_loss = if n_expr > 0 {
            let mask = Tensor::from_vec(expressive, n, device)?;
            let err = (&pred - &batch.intensity)?.abs()?;
            (err.mul(&mask)?.sum_all()? / n_expr as f64)?
        } else {
            scalar(0.0, device)?
        };

        let neutral_loss = if n_neut > 0 {
            let mask = Tensor::from_vec(neutral, n, device)?;
            let hinge = pred
                .abs()?
                .affine(1.0, -(self.config.dead_zone as f64))?
                .relu()?;
            (hinge.mul(&mask)?.sum_all()? / n_neut as f64)?
        } else {
            scalar(0.0, device)?
        };

        Ok((expressive_loss, neutral_loss, n_expr, n_neut))
    }

    /// Multi-Similarity loss over L2-normalized features of non-neutral rows.
    ///
    /// Returns the loss and the number of mined pairs.
    pub fn metric_loss(&self, features: &Tensor, labels: &Tensor) -> Result<(Tensor, usize)> {
        let device = features.device();
        let rows = labels.to_vec2::<f32>()?;
        let keep: Vec<u32> = rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r.iter().any(|&v| v > 0.5))
            .map(|(i, _)| i as u32)
            .collect();
        if keep.len() < self.config.min_metric_rows.max(2) {
            return Ok((scalar(0.0, device)?, 0));
        }

        let kept_rows: Vec<Vec<f32>> = keep.iter().map(|&i| rows[i as usize].clone()).collect();
        let pairs = self.miner.mine_rows(&kept_rows);
        if pairs.is_empty() {
            return Ok((scalar(0.0, device)?, 0));
        }

        let m = keep.len();
        let idx = Tensor::from_vec(keep, m, device)?;
        let feats = features.index_select(&idx, 0)?;
        let norm = feats.sqr()?.sum_keepdim(1)?.affine(1.0, NORM_EPS)?.sqrt()?;
        let feats = feats.broadcast_div(&norm)?;
        let sim = feats.matmul(&feats.t()?.contiguous()?)?;

        let mut pos_mask = vec![0f32; m * m];
        let mut neg_mask = vec![0f32; m * m];
        for (i, j) in pairs.positives() {
            pos_mask[i * m + j] = 1.0;
        }
        for (i, j) in pairs.negatives() {
            neg_mask[i * m + j] = 1.0;
        }
        let pos_mask = Tensor::from_vec(pos_mask, (m, m), device)?;
        let neg_mask = Tensor::from_vec(neg_mask, (m, m), device)?;

        let (alpha, beta, base) = (
            self.config.ms_alpha as f64,
            self.config.ms_beta as f64,
            self.config.ms_base as f64,
        );
        // exp(-alpha (s - base)) over positives, exp(beta (s - base)) over negatives
        let pos_term = sim
            .affine(-alpha, alpha * base)?
            .exp()?
            .mul(&pos_mask)?
            .sum(1)?
            .affine(1.0, 1.0)?
            .log()?
            .affine(1.0 / alpha, 0.0)?;
        let neg_term = sim
            .affine(beta, -beta * base)?
            .exp()?
            .mul(&neg_mask)?
            .sum(1)?
            .affine(1.0, 1.0)?
            .log()?
            .affine(1.0 / beta, 0.0)?;

        let loss = (pos_term + neg_term)?.mean_all()?;
        Ok((loss, pairs.num_positive() + pairs.num_negative()))
    }
}

impl LossFunction for CompositeLoss {
    fn compute(&self, output: &ModelOutput, batch: &Batch) -> Result<(Tensor, LossComponents)> {
        let device = output.emotion_logits.device();
        if batch.is_empty() {
            return Ok((scalar(0.0, device)?, LossComponents::default()));
        }
        let labels = batch.labels.to_dtype(DType::F32)?;

        let emotion = self.emotion_loss(&output.emotion_logits, &labels)?;
        let (expressive, neutral, expressive_rows, neutral_rows) =
            self.intensity_terms(&output.emotion_logits, &output.intensity_logit, batch)?;
        let intensity = (&expressive + neutral.affine(self.config.neutral_weight as f64, 0.0)?)?;
        let (metric, metric_pairs) = self.metric_loss(&output.emotion_features, &labels)?;

        let total = (&emotion
            + intensity.affine(self.intensity_weight as f64, 0.0)?
            + metric.affine(self.metric_weight as f64, 0.0)?)?;

        let components = LossComponents {
            emotion: emotion.to_scalar::<f32>()?,
            intensity: intensity.to_scalar::<f32>()?,
            expressive: expressive.to_scalar::<f32>()?,
            neutral: neutral.to_scalar::<f32>()?,
            metric: metric.to_scalar::<f32>()?,
            total: total.to_scalar::<f32>()?,
            expressive_rows,
            neutral_rows,
            metric_pairs,
        };
        Ok((total, components))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::Cpu
    }

    fn batch(labels: &[&[f32]], intensity: &[f32]) -> Batch {
        let d = device();
        let n = labels.len();
        let l = labels.first().map(|r| r.len()).unwrap_or(0);
        let flat: Vec<f32> = labels.iter().flat_map(|r| r.iter().copied()).collect();
        Batch {
            input_ids: Tensor::ones((n, 2), DType::U32, &d).unwrap(),
            attention_mask: Tensor::ones((n, 2), DType::U32, &d).unwrap(),
            labels: Tensor::from_vec(flat, (n, l), &d).unwrap(),
            intensity: Tensor::from_slice(intensity, n, &d).unwrap(),
        }
    }

    fn output(logits: &[&[f32]], intensity: &[f32], features: &[&[f32]]) -> ModelOutput {
        let d = device();
        let n = logits.len();
        let l = logits[0].len();
        let h = features[0].len();
        let flat: Vec<f32> = logits.iter().flat_map(|r| r.iter().copied()).collect();
        let feat: Vec<f32> = features.iter().flat_map(|r| r.iter().copied()).collect();
        let feats = Tensor::from_vec(feat, (n, h), &d).unwrap();
        ModelOutput {
            emotion_logits: Tensor::from_vec(flat, (n, l), &d).unwrap(),
            intensity_logit: Tensor::from_slice(intensity, (n, 1), &d).unwrap(),
            emotion_features: feats.clone(),
            intensity_features: feats,
        }
    }

    fn loss(pos_weight: &[f32]) -> CompositeLoss {
        CompositeLoss::new(pos_weight, LossConfig::default(), 1.0, 0.1, &device()).unwrap()
    }

    fn example(labels: &[f32]) -> Example {
        Example {
            text: "x".into(),
            labels: labels.to_vec(),
            intensity: 0.0,
        }
    }

    #[test]
    fn test_pos_weights_ratio_and_cap() {
        let examples = vec![
            example(&[1.0, 1.0]),
            example(&[0.0, 1.0]),
            example(&[0.0, 1.0]),
            example(&[0.0, 0.0]),
        ];
        let w = pos_weights(&examples, 2, 2.0).unwrap();
        assert_eq!(w[0], 2.0, "3/1 capped at 2");
        assert!((w[1] - 1.0 / 3.0).abs() < 1e-4);
        assert!(pos_weights(&[], 2, 2.0).is_err());
    }

    #[test]
    fn test_emotion_loss_matches_closed_form() {
        let l = loss(&[2.0, 1.0]);
        let logits = Tensor::new(&[[0.5f32, -1.0]], &device()).unwrap();
        let targets = Tensor::new(&[[1f32, 0.0]], &device()).unwrap();
        let got = l.emotion_loss(&logits, &targets).unwrap().to_scalar::<f32>().unwrap();

        let sp = |x: f32| (1.0 + x.exp()).ln();
        let expected = (2.0 * sp(-0.5) + sp(-1.0)) / 2.0;
        assert!((got - expected).abs() < 1e-5, "{got} vs {expected}");
    }

    #[test]
    fn test_emotion_loss_is_stable_for_large_logits() {
        let l = loss(&[1.0]);
        let logits = Tensor::new(&[[200f32], [-200.0]], &device()).unwrap();
        let targets = Tensor::new(&[[1f32], [0.0]], &device()).unwrap();
        let got = l.emotion_loss(&logits, &targets).unwrap().to_scalar::<f32>().unwrap();
        assert!(got.is_finite());
        assert!(got < 1e-6);
    }

    #[test]
    fn test_expressive_example_uses_l1_branch() {
        let l = loss(&[1.0, 1.0, 1.0]);
        let b = batch(&[&[1.0, 0.0, 0.0]], &[0.8]);
        let out = output(&[&[2.0, -2.0, -2.0]], &[0.5], &[&[1.0, 0.0]]);
        let (_, c) = l.compute(&out, &b).unwrap();
        assert_eq!(c.expressive_rows, 1);
        assert_eq!(c.neutral_rows, 0);
        assert!((c.expressive - 0.3).abs() < 1e-5);
        assert_eq!(c.neutral, 0.0);
    }

    #[test]
    fn test_neutral_example_uses_hinge_branch() {
        let l = loss(&[1.0, 1.0]);
        // sigmoid(-3.5) ~ 0.03, below the 0.05 floor
        let b = batch(&[&[0.0, 0.0]], &[0.0]);
        let out = output(&[&[-3.5, -3.5]], &[0.3], &[&[1.0, 0.0]]);
        let (_, c) = l.compute(&out, &b).unwrap();
        assert_eq!(c.neutral_rows, 1);
        assert_eq!(c.expressive_rows, 0);
        assert!((c.neutral - 0.25).abs() < 1e-5);
        assert!((c.intensity - 3.0 * 0.25).abs() < 1e-5);
    }

    #[test]
    fn test_neutral_inside_dead_zone_costs_nothing() {
        let l = loss(&[1.0]);
        let b = batch(&[&[0.0]], &[0.0]);
        let out = output(&[&[-5.0]], &[-0.04], &[&[1.0]]);
        let (_, c) = l.compute(&out, &b).unwrap();
        assert_eq!(c.neutral, 0.0);
    }

    #[test]
    fn test_low_confidence_labelled_row_is_neutral_like() {
        let l = loss(&[1.0]);
        let b = batch(&[&[1.0]], &[0.9]);
        let out = output(&[&[-6.0]], &[0.0], &[&[1.0]]);
        let (_, c) = l.compute(&out, &b).unwrap();
        assert_eq!(c.neutral_rows, 1);
        assert_eq!(c.expressive, 0.0);
    }

    #[test]
    fn test_metric_loss_zero_below_min_rows() {
        let l = loss(&[1.0, 1.0]);
        let b = batch(&[&[1.0, 0.0], &[1.0, 0.0], &[0.0, 1.0]], &[0.5, 0.5, 0.5]);
        let out = output(
            &[&[1.0, 1.0], &[1.0, 1.0], &[1.0, 1.0]],
            &[0.5, 0.5, 0.5],
            &[&[1.0, 0.0], &[0.0, 1.0], &[1.0, 1.0]],
        );
        let (_, c) = l.compute(&out, &b).unwrap();
        assert_eq!(c.metric, 0.0);
        assert_eq!(c.metric_pairs, 0);
    }

    #[test]
    fn test_metric_term_needs_two_expressive_rows() {
        // even with the row floor lowered, one expressive row cannot form a pair
        let config = LossConfig {
            min_metric_rows: 0,
            ..LossConfig::default()
        };
        let l = CompositeLoss::new(&[1.0, 1.0], config, 1.0, 0.1, &device()).unwrap();
        let one = batch(&[&[1.0, 0.0], &[0.0, 0.0], &[0.0, 0.0]], &[0.7, 0.0, 0.0]);
        let out = output(
            &[&[2.0, -2.0], &[-4.0, -4.0], &[-4.0, -4.0]],
            &[0.6, 0.1, 0.0],
            &[&[1.0, 0.0], &[0.0, 1.0], &[1.0, 1.0]],
        );
        let (total, c) = l.compute(&out, &one).unwrap();
        assert_eq!(c.metric, 0.0);
        assert_eq!(c.metric_pairs, 0);
        assert!(c.total.is_finite());
        assert!((total.to_scalar::<f32>().unwrap() - c.total).abs() < 1e-6);
    }

    #[test]
    fn test_all_neutral_batch_has_no_metric_term() {
        let l = loss(&[1.0, 1.0]);
        let b = batch(&[&[0.0, 0.0], &[0.0, 0.0]], &[0.0, 0.0]);
        let out = output(
            &[&[-4.0, -4.0], &[-3.0, -5.0]],
            &[0.2, -0.01],
            &[&[1.0, 0.0], &[0.0, 1.0]],
        );
        let (_, c) = l.compute(&out, &b).unwrap();
        assert_eq!(c.metric_pairs, 0);
        assert_eq!(c.metric, 0.0);
        assert_eq!(c.expressive_rows, 0);
        assert!(c.total.is_finite() && c.total > 0.0);
    }

    #[test]
    fn test_weighted_bce_loss_ignores_intensity() {
        let bce = WeightedBceLoss::new(&[2.0, 1.0], &device()).unwrap();
        let b = batch(&[&[1.0, 0.0]], &[0.9]);
        let near = output(&[&[0.5, -1.0]], &[0.9], &[&[1.0, 0.0]]);
        let far = output(&[&[0.5, -1.0]], &[-5.0], &[&[0.0, 1.0]]);
        let (_, a) = bce.compute(&near, &b).unwrap();
        let (_, c) = bce.compute(&far, &b).unwrap();
        assert_eq!(a, c);
        assert_eq!(a.total, a.emotion);
        assert_eq!(a.intensity, 0.0);

        let composite = loss(&[2.0, 1.0]);
        let (_, full) = composite.compute(&near, &b).unwrap();
        assert!((full.emotion - a.emotion).abs() < 1e-6);
        assert!(WeightedBceLoss::new(&[], &device()).is_err());
    }

    #[test]
    fn test_metric_loss_prefers_aligned_features() {
        let l = loss(&[1.0, 1.0]);
        let labels = Tensor::new(
            &[[1f32, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]],
            &device(),
        )
        .unwrap();
        let aligned = Tensor::new(
            &[[1f32, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]],
            &device(),
        )
        .unwrap();
        let crossed = Tensor::new(
            &[[1f32, 0.0], [0.0, 1.0], [1.0, 0.0], [0.0, 1.0]],
            &device(),
        )
        .unwrap();
        let (good, pairs) = l.metric_loss(&aligned, &labels).unwrap();
        let (bad, _) = l.metric_loss(&crossed, &labels).unwrap();
        assert_eq!(pairs, 12);
        assert!(good.to_scalar::<f32>().unwrap() < bad.to_scalar::<f32>().unwrap());
    }

    #[test]
    fn test_compute_is_deterministic() {
        let l = loss(&[1.5, 0.5]);
        let b = batch(
            &[&[1.0, 0.0], &[1.0, 1.0], &[0.0, 1.0], &[0.0, 0.0], &[1.0, 0.0]],
            &[0.4, 0.9, 0.2, 0.0, 0.6],
        );
        let out = output(
            &[&[0.3, -0.2], &[1.0, 0.8], &[-0.5, 0.9], &[-4.0, -4.0], &[0.7, -1.0]],
            &[0.3, 0.7, 0.1, 0.2, 0.5],
            &[&[0.1, 0.9], &[0.5, 0.5], &[0.9, 0.1], &[0.3, 0.3], &[0.2, 0.8]],
        );
        let (_, a) = l.compute(&out, &b).unwrap();
        let (_, c) = l.compute(&out, &b).unwrap();
        assert_eq!(a, c);
        assert!(a.total.is_finite());
        assert!(a.metric_pairs > 0);
    }

    #[test]
    fn test_empty_pos_weight_rejected() {
        assert!(CompositeLoss::new(&[], LossConfig::default(), 1.0, 1.0, &device()).is_err());
    }
}
