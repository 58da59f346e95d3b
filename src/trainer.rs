//! Supervised fine-tuning loop.
//!
//! Each micro-batch contributes `loss / gradient_accumulation_steps` to the
//! accumulated gradients. Every `gradient_accumulation_steps` micro-batches
//! the gradients are unscaled, clipped and applied with AdamW, then the
//! learning-rate schedule advances by one step. Non-finite gradients skip the
//! step when loss scaling is on and abort the run when it is off.
//!
//! Checkpoints land under the output directory:
//! - `checkpoint_step_{n}` every `save_steps` optimizer steps
//! - `checkpoint_best` whenever evaluation improves
//! - `checkpoint_epoch_{n}` after each epoch
//! - `checkpoint_final` at the end of the run

use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{
    epoch_checkpoint, load_checkpoint, step_checkpoint, CheckpointManager, TrainingState,
    BEST_CHECKPOINT, FINAL_CHECKPOINT,
};
use crate::config::TrainingConfig;
use crate::data::{collate, epoch_order, num_batches, stream_batches, SftDataset};
use crate::error::{RapportError, Result};
use crate::model::RapportModel;
use crate::optimizer::{AdamW, GradAccumulator, LossScaler};
use crate::progress::{progress_bar, ProgressCallback, StepUpdate};
use crate::scheduler::LRScheduler;

/// One logged point of an SFT run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Optimizer step
    pub step: usize,
    /// Mean loss over the steps since the previous record
    pub loss: f64,
    /// Learning rate after this step
    pub lr: f64,
    /// Fractional epoch, e.g. 1.5 halfway through the second epoch
    pub epoch: f64,
}

/// Supervised fine-tuning trainer.
pub struct SftTrainer {
    model: RapportModel,
    config: TrainingConfig,
    checkpoints: CheckpointManager,
    seed: u64,
    global_step: usize,
    epoch: usize,
    best_eval_loss: Option<f64>,
}

impl SftTrainer {
    /// Trainer starting from step zero.
    pub fn new(
        model: RapportModel,
        config: TrainingConfig,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            model,
            config,
            checkpoints: CheckpointManager::new(output_dir)?,
            seed: 42,
            global_step: 0,
            epoch: 0,
            best_eval_loss: None,
        })
    }

    /// Trainer continuing from a checkpoint: weights, step, completed
    /// epochs and best evaluation loss are restored.
    pub fn resume(
        checkpoint: impl AsRef<Path>,
        config: TrainingConfig,
        output_dir: impl Into<PathBuf>,
        device: &Device,
    ) -> Result<Self> {
        let (model, state) = load_checkpoint(checkpoint.as_ref(), device)?;
        let mut trainer = Self::new(model, config, output_dir)?;
        trainer.global_step = state.global_step;
        trainer.epoch = state.epoch;
        trainer.best_eval_loss = state.best_eval_loss;
        tracing::info!(
            "Resuming from step {} after {} completed epochs",
            state.global_step,
            state.epoch
        );
        Ok(trainer)
    }

    /// Seed for the per-epoch shuffle.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// The model being trained.
    pub fn model(&self) -> &RapportModel {
        &self.model
    }

    /// Give up the trained model.
    pub fn into_model(self) -> RapportModel {
        self.model
    }

    /// Optimizer steps taken, including resumed ones.
    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Epochs fully completed.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Lowest evaluation loss seen.
    pub fn best_eval_loss(&self) -> Option<f64> {
        self.best_eval_loss
    }

    /// Where checkpoints are written.
    pub fn output_dir(&self) -> &Path {
        self.checkpoints.output_dir()
    }

    /// Train for the remaining epochs and return the logged history.
    pub fn train(
        &mut self,
        train_set: &SftDataset,
        eval_set: Option<&SftDataset>,
        callback: &mut dyn ProgressCallback,
    ) -> Result<Vec<HistoryRecord>> {
        if train_set.is_empty() {
            return Err(RapportError::dataset("training set is empty"));
        }
        let cfg = self.config.clone();
        let accum = cfg.gradient_accumulation_steps;
        let batches_per_epoch = num_batches(train_set.len(), cfg.batch_size);
        let remaining_epochs = cfg.num_epochs.saturating_sub(self.epoch);
        let total_steps = batches_per_epoch * remaining_epochs / accum;

        tracing::info!("Starting SFT");
        tracing::info!("  Examples: {}", train_set.len());
        tracing::info!("  Epochs: {} (from {})", cfg.num_epochs, self.epoch);
        tracing::info!(
            "  Batch size: {} x {} accumulation",
            cfg.batch_size,
            accum
        );
        tracing::info!("  Optimizer steps: {}", total_steps);

        let params = self.model.named_parameters()?;
        let mut optimizer = AdamW::new(cfg.learning_rate, cfg.weight_decay);
        let mut scheduler = LRScheduler::from_kind(
            cfg.lr_scheduler,
            cfg.learning_rate,
            cfg.warmup_steps,
            total_steps,
        );
        optimizer.set_learning_rate(scheduler.get_lr());
        let mut scaler = LossScaler::new(cfg.mixed_precision);
        let mut grads = GradAccumulator::new();
        tracing::info!(
            "Initialized AdamW with lr={}, {} trainable params",
            cfg.learning_rate,
            self.model.parameter_count()?
        );

        let pb = progress_bar(total_steps, cfg.show_progress)?;
        let device = self.model.device().clone();
        let mut history = Vec::new();
        let mut step_loss = 0f64;
        let mut window_loss = 0f64;
        let mut window_steps = 0usize;

        for epoch in self.epoch..cfg.num_epochs {
            tracing::info!("Starting epoch {}/{}", epoch + 1, cfg.num_epochs);
            let order = epoch_order(train_set.len(), self.seed, epoch);

            stream_batches(
                train_set.examples(),
                &order,
                cfg.batch_size,
                cfg.prefetch_batches,
                |seqs| collate(seqs, &device),
                |idx, batch| {
                    let output = self.model.forward(
                        &batch.input_ids,
                        Some(&batch.attention_mask),
                        Some(&batch.labels),
                        true,
                    )?;
                    let loss = output
                        .loss
                        .ok_or_else(|| RapportError::training("forward pass returned no loss"))?;
                    let loss = (loss / accum as f64)?;
                    step_loss += loss.to_scalar::<f32>()? as f64;
                    grads.accumulate(&params, &scaler.scale_loss(&loss)?.backward()?)?;

                    if (idx + 1) % accum != 0 {
                        return Ok(());
                    }

                    let finite = scaler.unscale(&mut grads)?;
                    if !finite && !scaler.is_enabled() {
                        return Err(RapportError::training(format!(
                            "non-finite gradients at step {}",
                            self.global_step + 1
                        )));
                    }
                    if finite {
                        grads.clip(cfg.max_grad_norm)?;
                        optimizer.step(&params, grads.grads())?;
                    }
                    scaler.update(finite);
                    scheduler.step(&mut optimizer);
                    grads.clear();
                    self.global_step += 1;

                    let lr = optimizer.learning_rate();
                    let loss = std::mem::take(&mut step_loss);
                    window_loss += loss;
                    window_steps += 1;
                    pb.set_message(format!("{loss:.4}"));
                    pb.inc(1);
                    callback.on_step(&StepUpdate {
                        step: self.global_step,
                        total_steps,
                        loss,
                        lr,
                        epoch,
                    });

                    if self.global_step % cfg.logging_steps == 0 {
                        let record = HistoryRecord {
                            step: self.global_step,
                            loss: window_loss / window_steps as f64,
                            lr,
                            epoch: epoch as f64 + (idx + 1) as f64 / batches_per_epoch as f64,
                        };
                        let line = format!(
                            "Step {}/{}, Epoch {:.2}, Loss: {:.4}, LR: {:.2e}",
                            record.step, total_steps, record.epoch, record.loss, record.lr
                        );
                        tracing::info!("{line}");
                        callback.on_log(&line);
                        history.push(record);
                        window_loss = 0.0;
                        window_steps = 0;
                    }

                    if let Some(eval_set) = eval_set {
                        if self.global_step % cfg.eval_steps == 0 {
                            let eval_loss = self.evaluate(eval_set)?;
                            let line = format!("Step {}, Eval loss: {eval_loss:.4}", self.global_step);
                            tracing::info!("{line}");
                            callback.on_log(&line);
                            if self.best_eval_loss.map_or(true, |best| eval_loss < best) {
                                self.best_eval_loss = Some(eval_loss);
                                self.save(BEST_CHECKPOINT)?;
                            }
                        }
                    }

                    if self.global_step % cfg.save_steps == 0 {
                        self.save(&step_checkpoint(self.global_step))?;
                    }
                    Ok(())
                },
            )?;

            self.epoch = epoch + 1;
            self.save(&epoch_checkpoint(self.epoch))?;
            let line = format!("Epoch {} complete, step {}", self.epoch, self.global_step);
            tracing::info!("{line}");
            callback.on_log(&line);
        }

        if !grads.is_empty() {
            tracing::debug!(
                "discarding {} micro-batches short of an accumulation boundary",
                grads.micro_steps()
            );
            grads.clear();
        }
        if scaler.skipped_steps() > 0 {
            tracing::warn!("{} steps skipped on non-finite gradients", scaler.skipped_steps());
        }

        pb.finish_with_message("Training complete");
        self.save(FINAL_CHECKPOINT)?;
        Ok(history)
    }

    /// Mean loss over `dataset` without dropout or parameter updates.
    pub fn evaluate(&self, dataset: &SftDataset) -> Result<f64> {
        if dataset.is_empty() {
            return Err(RapportError::dataset("evaluation set is empty"));
        }
        let device = self.model.device();
        let mut total = 0f64;
        let mut batches = 0usize;
        for chunk in dataset.examples().chunks(self.config.batch_size) {
            let seqs: Vec<_> = chunk.iter().collect();
            let batch = collate(&seqs, device)?;
            let output = self.model.forward(
                &batch.input_ids,
                Some(&batch.attention_mask),
                Some(&batch.labels),
                false,
            )?;
            let loss = output
                .loss
                .ok_or_else(|| RapportError::training("forward pass returned no loss"))?;
            total += loss.detach().to_scalar::<f32>()? as f64;
            batches += 1;
        }
        Ok(total / batches as f64)
    }

    /// Publish a checkpoint of the current model and counters.
    pub fn save(&self, name: &str) -> Result<PathBuf> {
        let state = TrainingState::new(self.global_step, self.epoch, self.best_eval_loss);
        self.checkpoints.save(name, &self.model, &state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelParameters;
    use crate::data::SftRecord;
    use crate::progress::NoProgress;
    use crate::scheduler::ScheduleKind;
    use crate::tokenizer::ByteEncoder;
    use tempfile::TempDir;

    fn tiny_config() -> TrainingConfig {
        TrainingConfig {
            num_epochs: 1,
            batch_size: 1,
            gradient_accumulation_steps: 1,
            learning_rate: 1e-3,
            warmup_steps: 0,
            save_steps: 100,
            eval_steps: 100,
            logging_steps: 1,
            mixed_precision: false,
            prefetch_batches: 0,
            show_progress: false,
            ..TrainingConfig::default()
        }
    }

    fn dataset(n: usize) -> SftDataset {
        let records: Vec<SftRecord> = (0..n)
            .map(|i| SftRecord {
                instruction: format!("Say {i}"),
                input: String::new(),
                output: format!("{i}"),
            })
            .collect();
        SftDataset::from_records(&records, &ByteEncoder, 24).unwrap()
    }

    fn model() -> RapportModel {
        RapportModel::new(&ModelParameters::tiny(), &Device::Cpu).unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        steps: Vec<StepUpdate>,
        lines: Vec<String>,
    }

    impl ProgressCallback for Recorder {
        fn on_step(&mut self, update: &StepUpdate) {
            self.steps.push(update.clone());
        }
        fn on_log(&mut self, line: &str) {
            self.lines.push(line.to_string());
        }
    }

    #[test]
    fn test_accumulation_controls_step_count() {
        let dir = TempDir::new().unwrap();
        let config = TrainingConfig {
            num_epochs: 2,
            gradient_accumulation_steps: 2,
            ..tiny_config()
        };
        let mut trainer = SftTrainer::new(model(), config, dir.path()).unwrap();
        let mut recorder = Recorder::default();
        trainer.train(&dataset(4), None, &mut recorder).unwrap();

        assert_eq!(trainer.global_step(), 4);
        assert_eq!(recorder.steps.len(), 4);
        assert_eq!(recorder.steps[0].total_steps, 4);
        assert_eq!(trainer.epoch(), 2);
        assert!(!recorder.lines.is_empty());
    }

    #[test]
    fn test_partial_accumulation_carries_over() {
        let dir = TempDir::new().unwrap();
        let config = TrainingConfig {
            num_epochs: 2,
            gradient_accumulation_steps: 2,
            ..tiny_config()
        };
        // 3 micro-batches per epoch; the boundary is per-epoch batch index.
        let mut trainer = SftTrainer::new(model(), config, dir.path()).unwrap();
        trainer.train(&dataset(3), None, &mut NoProgress).unwrap();
        assert_eq!(trainer.global_step(), 2);
    }

    #[test]
    fn test_history_epoch_fraction() {
        let dir = TempDir::new().unwrap();
        let mut trainer = SftTrainer::new(model(), tiny_config(), dir.path()).unwrap();
        let history = trainer.train(&dataset(2), None, &mut NoProgress).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].step, 1);
        assert!((history[0].epoch - 0.5).abs() < 1e-9);
        assert!((history[1].epoch - 1.0).abs() < 1e-9);
        assert!(history.iter().all(|r| r.loss.is_finite()));
    }

    #[test]
    fn test_eval_saves_best_checkpoint() {
        let dir = TempDir::new().unwrap();
        let config = TrainingConfig {
            eval_steps: 1,
            ..tiny_config()
        };
        let mut trainer = SftTrainer::new(model(), config, dir.path()).unwrap();
        trainer.train(&dataset(2), Some(&dataset(1)), &mut NoProgress).unwrap();
        assert!(trainer.best_eval_loss().is_some());
        assert!(dir.path().join(BEST_CHECKPOINT).is_dir());
    }

    #[test]
    fn test_save_steps_and_epoch_checkpoints() {
        let dir = TempDir::new().unwrap();
        let config = TrainingConfig {
            save_steps: 2,
            ..tiny_config()
        };
        let mut trainer = SftTrainer::new(model(), config, dir.path()).unwrap();
        trainer.train(&dataset(3), None, &mut NoProgress).unwrap();
        assert!(dir.path().join("checkpoint_step_2").is_dir());
        assert!(!dir.path().join("checkpoint_step_3").exists());
        assert!(dir.path().join("checkpoint_epoch_1").is_dir());
        assert!(dir.path().join(FINAL_CHECKPOINT).is_dir());
    }

    #[test]
    fn test_training_reduces_loss() {
        let dir = TempDir::new().unwrap();
        let config = TrainingConfig {
            num_epochs: 8,
            ..tiny_config()
        };
        let data = dataset(2);
        let mut trainer = SftTrainer::new(model(), config, dir.path()).unwrap();
        let before = trainer.evaluate(&data).unwrap();
        trainer.train(&data, None, &mut NoProgress).unwrap();
        let after = trainer.evaluate(&data).unwrap();
        assert!(after < before, "loss went from {before} to {after}");
    }

    #[test]
    fn test_mixed_precision_run_is_finite() {
        let dir = TempDir::new().unwrap();
        let config = TrainingConfig {
            mixed_precision: true,
            prefetch_batches: 2,
            ..tiny_config()
        };
        let mut trainer = SftTrainer::new(model(), config, dir.path()).unwrap();
        let history = trainer.train(&dataset(2), None, &mut NoProgress).unwrap();
        assert_eq!(trainer.global_step(), 2);
        assert!(history.iter().all(|r| r.loss.is_finite()));
    }

    #[test]
    fn test_non_finite_gradients_abort_without_loss_scaling() {
        let dir = TempDir::new().unwrap();
        let config = TrainingConfig {
            learning_rate: 1e30,
            ..tiny_config()
        };
        let mut trainer = SftTrainer::new(model(), config, dir.path()).unwrap();
        let err = trainer
            .train(&dataset(8), None, &mut NoProgress)
            .unwrap_err();
        assert!(err.to_string().contains("non-finite gradients"), "{err}");
        assert!(trainer.global_step() < 8);
        assert!(!dir.path().join(FINAL_CHECKPOINT).exists());
    }

    #[test]
    fn test_constant_schedule_holds_learning_rate() {
        let dir = TempDir::new().unwrap();
        let config = TrainingConfig {
            lr_scheduler: ScheduleKind::Constant,
            ..tiny_config()
        };
        let mut trainer = SftTrainer::new(model(), config, dir.path()).unwrap();
        let mut recorder = Recorder::default();
        trainer.train(&dataset(3), None, &mut recorder).unwrap();
        assert_eq!(recorder.steps.len(), 3);
        assert!(recorder.steps.iter().all(|s| s.lr == 1e-3));
    }

    #[test]
    fn test_cosine_schedule_decays_to_zero() {
        let dir = TempDir::new().unwrap();
        let config = TrainingConfig {
            lr_scheduler: ScheduleKind::Cosine,
            ..tiny_config()
        };
        let mut trainer = SftTrainer::new(model(), config, dir.path()).unwrap();
        let mut recorder = Recorder::default();
        trainer.train(&dataset(4), None, &mut recorder).unwrap();
        let lrs: Vec<f64> = recorder.steps.iter().map(|s| s.lr).collect();
        assert!(lrs.windows(2).all(|w| w[1] < w[0]), "{lrs:?}");
        assert!(lrs[3].abs() < 1e-12);
    }

    #[test]
    fn test_empty_training_set_fails() {
        let dir = TempDir::new().unwrap();
        let mut trainer = SftTrainer::new(model(), tiny_config(), dir.path()).unwrap();
        let empty = SftDataset::from_sequences(Vec::new());
        assert!(trainer.train(&empty, None, &mut NoProgress).is_err());
        assert_eq!(trainer.global_step(), 0);
    }
}
