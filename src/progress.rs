//! Progress reporting shared by the trainers.

use indicatif::{ProgressBar, ProgressStyle};

use crate::error::Result;

/// Snapshot passed to [`ProgressCallback::on_step`] after every optimizer step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepUpdate {
    /// Optimizer steps taken, counting resumed ones
    pub step: usize,
    /// Steps planned for this run
    pub total_steps: usize,
    /// Loss of the step just taken
    pub loss: f64,
    /// Learning rate after the scheduler advanced
    pub lr: f64,
    /// Zero-based epoch the step belongs to
    pub epoch: usize,
}

/// Receives training progress. Both methods default to doing nothing.
pub trait ProgressCallback {
    /// Called after every optimizer step.
    fn on_step(&mut self, _update: &StepUpdate) {}

    /// Called with every human-readable log line the trainer emits.
    fn on_log(&mut self, _line: &str) {}
}

/// Callback that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressCallback for NoProgress {}

/// Terminal progress bar over `total` steps; hidden unless `visible`.
pub fn progress_bar(total: usize, visible: bool) -> Result<ProgressBar> {
    if !visible {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}
