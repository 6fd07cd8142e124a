//! Per-label temperature scaling.
//!
//! Each label gets its own `T > 0` minimizing `BCE(sigmoid(x / T), y)` on a
//! held-out split. The fit runs on `theta = ln T` so positivity holds by
//! construction, using damped Newton steps with a backtracking line search.
//! The loop is capped by iteration count; whatever it reaches is returned.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AffectError, Result};
use crate::labels::LabelSet;

const MIN_T: f64 = 1e-3;
const MAX_T: f64 = 1e3;
const GRAD_TOL: f64 = 1e-9;
const ARMIJO: f64 = 1e-4;
const MIN_STEP: f64 = 1e-12;

/// Persisted temperatures in manifest order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureParams {
    pub temperature: Vec<f64>,
    pub label_order: Vec<String>,
}

impl TemperatureParams {
    /// Neutral scaling (`T = 1` everywhere).
    pub fn identity(labels: &LabelSet) -> Self {
        Self {
            temperature: vec![1.0; labels.len()],
            label_order: labels.names().to_vec(),
        }
    }

    pub fn apply(&self, label_idx: usize, logit: f64) -> f64 {
        let t = self.temperature.get(label_idx).copied().unwrap_or(1.0);
        logit / t
    }

    pub(crate) fn check_labels(&self, labels: &LabelSet, path: &Path) -> Result<()> {
        labels.ensure_same_order(&self.label_order, path)?;
        if self.temperature.len() != labels.len() {
            return Err(AffectError::artifact(
                path,
                format!(
                    "{} temperatures for {} labels",
                    self.temperature.len(),
                    labels.len()
                ),
            ));
        }
        if let Some(t) = self.temperature.iter().find(|t| !(t.is_finite() && **t > 0.0)) {
            return Err(AffectError::artifact(
                path,
                format!("temperature {} is not a positive finite value", t),
            ));
        }
        Ok(())
    }
}

/// Outcome of fitting one label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabelFit {
    pub temperature: f64,
    pub iterations: usize,
    pub converged: bool,
    pub loss_before: f64,
    pub loss_after: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureReport {
    pub params: TemperatureParams,
    pub fits: Vec<LabelFit>,
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

fn softplus(z: f64) -> f64 {
    z.max(0.0) + (-z.abs()).exp().ln_1p()
}

/// Mean BCE of `sigmoid(x * exp(-theta))` against `y`.
fn loss_at(x: &[f64], y: &[f64], theta: f64) -> f64 {
    let scale = (-theta).exp();
    let sum: f64 = x
        .iter()
        .zip(y)
        .map(|(&xi, &yi)| {
            let z = xi * scale;
            softplus(z) - yi * z
        })
        .sum();
    sum / x.len() as f64
}

/// First and second derivative of [`loss_at`] in `theta`.
fn derivatives(x: &[f64], y: &[f64], theta: f64) -> (f64, f64) {
    let scale = (-theta).exp();
    let n = x.len() as f64;
    let (mut g, mut h) = (0.0, 0.0);
    for (&xi, &yi) in x.iter().zip(y) {
        let z = xi * scale;
        let s = sigmoid(z);
        g += (s - yi) * -z;
        h += s * (1.0 - s) * z * z + (s - yi) * z;
    }
    (g / n, h / n)
}

fn fit_one(x: &[f64], y: &[f64], max_iter: usize) -> LabelFit {
    let (lo, hi) = (MIN_T.ln(), MAX_T.ln());
    let mut theta = 0.0f64;
    let loss_before = loss_at(x, y, theta);
    let mut loss = loss_before;
    let mut converged = false;
    let mut iterations = 0;

    while iterations < max_iter {
        iterations += 1;
        let (g, h) = derivatives(x, y, theta);
        if g.abs() < GRAD_TOL {
            converged = true;
            break;
        }
        let mut dir = if h > 1e-12 { -g / h } else { -g };
        if dir * g >= 0.0 {
            dir = -g;
        }

        let mut t = 1.0;
        let mut accepted = None;
        while t * dir.abs() > MIN_STEP {
            let candidate = (theta + t * dir).clamp(lo, hi);
            let candidate_loss = loss_at(x, y, candidate);
            if candidate_loss <= loss + ARMIJO * (candidate - theta) * g {
                accepted = Some((candidate, candidate_loss));
                break;
            }
            t *= 0.5;
        }
        match accepted {
            Some((next, next_loss)) if (next - theta).abs() > MIN_STEP => {
                theta = next;
                loss = next_loss;
            }
            _ => {
                // no descent left: at the optimum or pinned at a bound
                converged = true;
                break;
            }
        }
    }

    LabelFit {
        temperature: theta.exp().clamp(MIN_T, MAX_T),
        iterations,
        converged,
        loss_before,
        loss_after: loss,
    }
}

/// Fit one temperature per label from `[N][L]` logits and multi-hot targets.
pub fn fit_temperature(
    logits: &[Vec<f32>],
    targets: &[Vec<f32>],
    labels: &LabelSet,
    max_iter: usize,
) -> Result<TemperatureReport> {
    if logits.is_empty() {
        return Err(AffectError::Data(
            "temperature fitting needs at least one example".into(),
        ));
    }
    if logits.len() != targets.len() {
        return Err(AffectError::Data(format!(
            "{} logit rows for {} target rows",
            logits.len(),
            targets.len()
        )));
    }
    let l = labels.len();
    if logits.iter().chain(targets).any(|r| r.len() != l) {
        return Err(AffectError::Data(format!(
            "logit/target rows must have {} entries",
            l
        )));
    }
    if logits.iter().flatten().any(|v| !v.is_finite()) {
        return Err(AffectError::Numerical(
            "non-finite logits passed to temperature fitting".into(),
        ));
    }

    let mut fits = Vec::with_capacity(l);
    for (j, name) in labels.names().iter().enumerate() {
        let x: Vec<f64> = logits.iter().map(|r| r[j] as f64).collect();
        let y: Vec<f64> = targets.iter().map(|r| r[j] as f64).collect();
        let fit = fit_one(&x, &y, max_iter.max(1));
        if !(fit.temperature.is_finite() && fit.temperature > 0.0) || !fit.loss_after.is_finite() {
            return Err(AffectError::Numerical(format!(
                "temperature fit for '{}' produced T={} loss={}",
                name, fit.temperature, fit.loss_after
            )));
        }
        if !fit.converged {
            warn!(
                "Temperature for '{}' did not converge in {} iterations (T={:.4})",
                name, fit.iterations, fit.temperature
            );
        }
        debug!(
            "Temperature '{}': T={:.4} loss {:.5} -> {:.5} ({} iters)",
            name, fit.temperature, fit.loss_before, fit.loss_after, fit.iterations
        );
        fits.push(fit);
    }

    Ok(TemperatureReport {
        params: TemperatureParams {
            temperature: fits.iter().map(|f| f.temperature).collect(),
            label_order: labels.names().to_vec(),
        },
        fits,
    })
}
