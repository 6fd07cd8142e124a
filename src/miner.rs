//! Positive/negative pair mining for multi-label metric learning.
//!
//! Multi-label rows have no single class, so "same class" is replaced by label
//! overlap. Similarity is the Jaccard index of the two active label sets:
//!
//! - positive: `jaccard(i, j) > threshold`
//! - negative: `jaccard(i, j) == 0`, which covers disjoint label sets and a
//!   neutral row paired with a non-neutral one
//! - neutral/neutral pairs and the diagonal are never mined

use candle_core::Tensor;

use crate::error::{AffectError, Result};

/// Ordered index pairs into the batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MinedPairs {
    pub pos_i: Vec<u32>,
    pub pos_j: Vec<u32>,
    pub neg_i: Vec<u32>,
    pub neg_j: Vec<u32>,
}

impl MinedPairs {
    pub fn num_positive(&self) -> usize {
        self.pos_i.len()
    }

    pub fn num_negative(&self) -> usize {
        self.neg_i.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pos_i.is_empty() && self.neg_i.is_empty()
    }

    pub fn positives(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.pos_i
            .iter()
            .zip(&self.pos_j)
            .map(|(&i, &j)| (i as usize, j as usize))
    }

    pub fn negatives(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.neg_i
            .iter()
            .zip(&self.neg_j)
            .map(|(&i, &j)| (i as usize, j as usize))
    }
}

/// Source of supervision pairs for the metric-learning term.
pub trait PairMiner: Send + Sync {
    /// Mine pairs from host-side multi-hot rows.
    fn mine_rows(&self, labels: &[Vec<f32>]) -> MinedPairs;

    /// Mine pairs for `embeddings[N, H]` supervised by `labels[N, L]`.
    fn mine(&self, embeddings: &Tensor, labels: &Tensor) -> Result<MinedPairs> {
        let n = labels.dim(0)?;
        if embeddings.dim(0)? != n {
            return Err(AffectError::Data(format!(
                "{} embeddings for {} label rows",
                embeddings.dim(0)?,
                n
            )));
        }
        if n == 0 {
            return Ok(MinedPairs::default());
        }
        let rows = labels.to_dtype(candle_core::DType::F32)?.to_vec2::<f32>()?;
        Ok(self.mine_rows(&rows))
    }
}

/// Jaccard-overlap miner.
#[derive(Debug, Clone)]
pub struct MultiLabelPairMiner {
    threshold: f32,
}

impl MultiLabelPairMiner {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Default for MultiLabelPairMiner {
    fn default() -> Self {
        Self::new(0.15)
    }
}

/// Jaccard index of two multi-hot rows, `None` when both are empty.
pub fn jaccard(a: &[f32], b: &[f32]) -> Option<f32> {
    let mut inter = 0usize;
    let mut union = 0usize;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (x > 0.5, y > 0.5);
        if x && y {
            inter += 1;
        }
        if x || y {
            union += 1;
        }
    }
    (union > 0).then(|| inter as f32 / union as f32)
}

impl PairMiner for MultiLabelPairMiner {
    fn mine_rows(&self, labels: &[Vec<f32>]) -> MinedPairs {
        let expressive = labels
            .iter()
            .filter(|row| row.iter().any(|&v| v > 0.5))
            .count();
        if expressive < 2 {
            return MinedPairs::default();
        }

        let mut pairs = MinedPairs::default();
        for (i, a) in labels.iter().enumerate() {
            for (j, b) in labels.iter().enumerate() {
                if i == j {
                    continue;
                }
                let Some(sim) = jaccard(a, b) else {
                    continue;
                };
                if sim > self.threshold {
                    pairs.pos_i.push(i as u32);
                    pairs.pos_j.push(j as u32);
                } else if sim == 0.0 {
                    pairs.neg_i.push(i as u32);
                    pairs.neg_j.push(j as u32);
                }
            }
        }
        pairs
    }
}
