//! Ranking metrics used for model selection and reporting.
//!
//! ROC-AUC uses the Mann-Whitney rank formulation with average ranks for ties,
//! so it agrees with the trapezoidal ROC integral.

use serde::{Deserialize, Serialize};

/// Validation/test metrics for one pass over a split.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalMetrics {
    /// Mean AUC over labels with both classes present. Monitored for early stopping.
    pub macro_auc: f64,
    /// AUC over the flattened score/label matrix.
    pub micro_auc: f64,
    /// `None` where a label had only one class in the split.
    pub per_label_auc: Vec<Option<f64>>,
    pub intensity_spearman: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
    pub num_examples: usize,
}

impl EvalMetrics {
    /// Compute from row-major probabilities `[N][L]` and targets.
    pub fn compute(
        probs: &[Vec<f32>],
        labels: &[Vec<f32>],
        intensity_pred: &[f32],
        intensity_true: &[f32],
    ) -> Self {
        let num_labels = labels.first().map(Vec::len).unwrap_or(0);

        let per_label_auc: Vec<Option<f64>> = (0..num_labels)
            .map(|j| {
                let scores: Vec<f64> = probs.iter().map(|r| r[j] as f64).collect();
                let truth: Vec<bool> = labels.iter().map(|r| r[j] > 0.5).collect();
                roc_auc(&scores, &truth)
            })
            .collect();
        let defined: Vec<f64> = per_label_auc.iter().flatten().copied().collect();
        let macro_auc = if defined.is_empty() {
            0.0
        } else {
            defined.iter().sum::<f64>() / defined.len() as f64
        };

        let flat_scores: Vec<f64> = probs.iter().flatten().map(|&p| p as f64).collect();
        let flat_truth: Vec<bool> = labels.iter().flatten().map(|&y| y > 0.5).collect();
        let micro_auc = roc_auc(&flat_scores, &flat_truth).unwrap_or(0.0);

        let intensity_spearman = if intensity_pred.is_empty() {
            None
        } else {
            let a: Vec<f64> = intensity_true.iter().map(|&v| v as f64).collect();
            let b: Vec<f64> = intensity_pred.iter().map(|&v| v as f64).collect();
            spearman(&a, &b)
        };

        Self {
            macro_auc,
            micro_auc,
            per_label_auc,
            intensity_spearman,
            loss: None,
            num_examples: labels.len(),
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "macro_auc={:.4} micro_auc={:.4} spearman={} loss={} (n={})",
            self.macro_auc,
            self.micro_auc,
            self.intensity_spearman
                .map(|s| format!("{:.4}", s))
                .unwrap_or_else(|| "n/a".into()),
            self.loss
                .map(|l| format!("{:.4}", l))
                .unwrap_or_else(|| "n/a".into()),
            self.num_examples,
        )
    }
}

/// 1-based ranks, ties receive the average of the ranks they span.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        // positions start..end hold ranks start+1..=end
        let rank = (start + 1 + end) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = rank;
        }
        start = end;
    }
    ranks
}

/// Area under the ROC curve; `None` when either class is absent.
pub fn roc_auc(scores: &[f64], truth: &[bool]) -> Option<f64> {
    let n_pos = truth.iter().filter(|&&t| t).count();
    let n_neg = truth.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return None;
    }
    let ranks = average_ranks(scores);
    let pos_rank_sum: f64 = ranks
        .iter()
        .zip(truth)
        .filter(|(_, &t)| t)
        .map(|(r, _)| r)
        .sum();
    let u = pos_rank_sum - (n_pos * (n_pos + 1)) as f64 / 2.0;
    Some(u / (n_pos as f64 * n_neg as f64))
}

/// Spearman rank correlation; `None` for mismatched lengths or constant input.
pub fn spearman(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.len() < 2 {
        return None;
    }
    pearson(&average_ranks(a), &average_ranks(b))
}

fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        let (dx, dy) = (x - mean_a, y - mean_b);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a == 0.0 || var_b == 0.0 {
        return None;
    }
    Some(cov / (var_a.sqrt() * var_b.sqrt()))
}
