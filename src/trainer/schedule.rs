//! Learning-rate schedules with linear warmup.

use crate::config::SchedulerKind;

#[derive(Debug, Clone)]
pub struct LrSchedule {
    kind: SchedulerKind,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LrSchedule {
    /// `warmup_ratio` of `total_steps`, rounded up, is spent ramping from 0.
    pub fn new(kind: SchedulerKind, base_lr: f64, warmup_ratio: f64, total_steps: usize) -> Self {
        let warmup_steps = (total_steps as f64 * warmup_ratio).ceil() as usize;
        Self {
            kind,
            base_lr,
            warmup_steps,
            total_steps,
        }
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Learning rate for optimizer step `step` (0-based).
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps.max(1) as f64;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        let progress = ((step - self.warmup_steps) as f64 / decay_steps).min(1.0);
        match self.kind {
            SchedulerKind::Constant => self.base_lr,
            SchedulerKind::Linear => self.base_lr * (1.0 - progress).max(0.0),
            SchedulerKind::Cosine => {
                self.base_lr * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_linear_warmup_then_decay() {
        let s = LrSchedule::new(SchedulerKind::Linear, 1.0, 0.1, 100);
        assert_eq!(s.warmup_steps(), 10);
        assert!(close(s.lr_at(0), 0.0));
        assert!(close(s.lr_at(5), 0.5));
        assert!(close(s.lr_at(10), 1.0));
        assert!(close(s.lr_at(55), 0.5));
        assert!(close(s.lr_at(100), 0.0));
        assert!(close(s.lr_at(150), 0.0));
    }

    #[test]
    fn test_cosine_midpoint() {
        let s = LrSchedule::new(SchedulerKind::Cosine, 2.0, 0.0, 10);
        assert!(close(s.lr_at(0), 2.0));
        assert!(close(s.lr_at(5), 1.0));
        assert!(s.lr_at(10).abs() < 1e-12);
    }

    #[test]
    fn test_constant_after_warmup() {
        let s = LrSchedule::new(SchedulerKind::Constant, 0.3, 0.5, 4);
        assert!(close(s.lr_at(1), 0.15));
        assert!(close(s.lr_at(2), 0.3));
        assert!(close(s.lr_at(40), 0.3));
    }

    #[test]
    fn test_warmup_rounds_up() {
        let s = LrSchedule::new(SchedulerKind::Linear, 1.0, 0.06, 10);
        assert_eq!(s.warmup_steps(), 1);
    }
}
