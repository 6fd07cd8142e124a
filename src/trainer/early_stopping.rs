//! Patience-based early stopping on a maximized metric.

/// Outcome of observing one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    Improved,
    Stalled { remaining: usize },
    Stop,
}

/// `best` follows every strict gain; the patience counter resets only when a
/// gain over the previous best exceeds `threshold`. Anything else increments
/// the counter, and the stage stops once it reaches `patience`.
///
/// `patience == 0` disables stopping.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    threshold: f64,
    best: Option<f64>,
    counter: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, threshold: f64) -> Self {
        Self {
            patience,
            threshold,
            best: None,
            counter: 0,
        }
    }

    pub fn observe(&mut self, metric: f64) -> StopDecision {
        let previous = self.best;
        if metric.is_finite() && previous.map_or(true, |best| metric > best) {
            self.best = Some(metric);
        }
        let improved = match previous {
            None => metric.is_finite(),
            Some(best) => metric > best && metric - best > self.threshold,
        };
        if improved {
            self.counter = 0;
            return StopDecision::Improved;
        }
        self.counter += 1;
        if self.patience > 0 && self.counter >= self.patience {
            StopDecision::Stop
        } else {
            StopDecision::Stalled {
                remaining: self.patience.saturating_sub(self.counter),
            }
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn counter(&self) -> usize {
        self.counter
    }
}
