//! Learning rate schedules shared by the SFT and DPO loops.

use serde::{Deserialize, Serialize};

use crate::optimizer::AdamW;

/// Shape of the learning rate once warmup is over.
///
/// Every kind ramps linearly from zero over `warmup_steps` first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    /// Decay linearly to zero at the last step
    #[default]
    Linear,
    /// Half-period cosine down to zero at the last step
    Cosine,
    /// Hold the peak rate
    Constant,
}

/// Step-indexed learning rate.
///
/// The rate for optimizer step `n` is `get_lr()` after `n` calls to
/// [`Self::step`], so the first step of a warmed-up run uses a rate of zero.
#[derive(Debug, Clone)]
pub struct LRScheduler {
    kind: ScheduleKind,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl LRScheduler {
    /// Schedule of the given kind peaking at `base_lr` after `warmup_steps`.
    pub fn from_kind(
        kind: ScheduleKind,
        base_lr: f64,
        warmup_steps: usize,
        total_steps: usize,
    ) -> Self {
        Self {
            kind,
            base_lr,
            warmup_steps,
            total_steps,
            current_step: 0,
        }
    }

    /// Linear warmup then linear decay.
    pub fn linear(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self::from_kind(ScheduleKind::Linear, base_lr, warmup_steps, total_steps)
    }

    /// Fixed rate with no warmup.
    pub fn constant(base_lr: f64) -> Self {
        Self::from_kind(ScheduleKind::Constant, base_lr, 0, 0)
    }

    pub fn kind(&self) -> ScheduleKind {
        self.kind
    }

    /// Rate for the current step.
    pub fn get_lr(&self) -> f64 {
        if self.current_step < self.warmup_steps {
            return self.base_lr * self.current_step as f64 / self.warmup_steps as f64;
        }
        let factor = match self.kind {
            ScheduleKind::Constant => 1.0,
            ScheduleKind::Linear => 1.0 - self.progress(),
            ScheduleKind::Cosine => 0.5 * (1.0 + (std::f64::consts::PI * self.progress()).cos()),
        };
        self.base_lr * factor.max(0.0)
    }

    /// Steps taken so far.
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Advance one step and push the new rate into the optimizer.
    pub fn step(&mut self, optimizer: &mut AdamW) {
        self.current_step += 1;
        optimizer.set_learning_rate(self.get_lr());
    }

    /// Fraction of the post-warmup span covered, clamped to 1.
    fn progress(&self) -> f64 {
        let span = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let done = self.current_step - self.warmup_steps;
        (done as f64 / span as f64).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(mut scheduler: LRScheduler, step: usize) -> f64 {
        scheduler.current_step = step;
        scheduler.get_lr()
    }

    #[test]
    fn test_constant_scheduler() {
        let scheduler = LRScheduler::constant(1e-3);
        assert_eq!(scheduler.get_lr(), 1e-3);
        assert_eq!(at(scheduler, 10_000), 1e-3);
    }

    #[test]
    fn test_constant_after_warmup() {
        let scheduler = LRScheduler::from_kind(ScheduleKind::Constant, 1e-3, 4, 10);
        assert_eq!(at(scheduler.clone(), 0), 0.0);
        assert!((at(scheduler.clone(), 2) - 5e-4).abs() < 1e-12);
        assert_eq!(at(scheduler, 9), 1e-3);
    }

    #[test]
    fn test_linear_warmup_and_decay() {
        let s = LRScheduler::linear(1e-3, 100, 1000);
        assert_eq!(s.kind(), ScheduleKind::Linear);
        assert_eq!(at(s.clone(), 0), 0.0);
        assert!((at(s.clone(), 50) - 5e-4).abs() < 1e-10);
        assert!((at(s.clone(), 100) - 1e-3).abs() < 1e-10);
        assert!((at(s.clone(), 550) - 5e-4).abs() < 1e-10);
        assert_eq!(at(s.clone(), 1000), 0.0);
        assert_eq!(at(s, 1500), 0.0);
    }

    #[test]
    fn test_linear_without_warmup_starts_at_peak() {
        let scheduler = LRScheduler::linear(2e-5, 0, 10);
        assert_eq!(scheduler.get_lr(), 2e-5);
    }

    #[test]
    fn test_warmup_longer_than_run() {
        // Default warmup exceeds tiny runs; the rate must stay finite.
        let scheduler = LRScheduler::linear(1.0, 500, 2);
        assert!((at(scheduler, 1) - 0.002).abs() < 1e-12);
    }

    #[test]
    fn test_degenerate_total() {
        for kind in [ScheduleKind::Linear, ScheduleKind::Cosine, ScheduleKind::Constant] {
            let scheduler = LRScheduler::from_kind(kind, 1.0, 0, 0);
            assert!(scheduler.get_lr().is_finite(), "{kind:?}");
        }
    }

    #[test]
    fn test_cosine_half_period() {
        let s = LRScheduler::from_kind(ScheduleKind::Cosine, 1e-3, 100, 1000);
        assert!((at(s.clone(), 50) - 5e-4).abs() < 1e-10);
        assert!((at(s.clone(), 100) - 1e-3).abs() < 1e-10);
        assert!((at(s.clone(), 550) - 5e-4).abs() < 1e-10);
        // Past the midpoint cosine sits below linear.
        let linear = LRScheduler::linear(1e-3, 100, 1000);
        assert!(at(s.clone(), 800) < at(linear, 800));
        assert!(at(s, 1000).abs() < 1e-10);
    }

    #[test]
    fn test_kind_names() {
        let kind: ScheduleKind = serde_yaml::from_str("cosine").unwrap();
        assert_eq!(kind, ScheduleKind::Cosine);
        assert_eq!(serde_yaml::to_string(&ScheduleKind::Constant).unwrap().trim(), "constant");
    }

    #[test]
    fn test_step_updates_optimizer() {
        let mut optimizer = AdamW::new(1e-3, 0.0);
        let mut scheduler = LRScheduler::linear(1e-3, 2, 10);
        scheduler.step(&mut optimizer);
        assert_eq!(scheduler.current_step(), 1);
        assert!((optimizer.learning_rate() - 5e-4).abs() < 1e-12);
    }
}
