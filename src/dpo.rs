//! Direct preference optimization.
//!
//! The policy is trained against a frozen reference on (chosen, rejected)
//! pairs sharing a prompt:
//!
//! ```text
//! loss = -log_sigmoid(beta * ((pi_c - pi_r) - (ref_c - ref_r)))
//! ```
//!
//! where each term is a length-normalized sequence log-probability.

use std::path::{Path, PathBuf};

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{CheckpointManager, TrainingState, DPO_MODEL};
use crate::config::DpoConfig;
use crate::data::{collate_pairs, epoch_order, num_batches, Batch, PreferenceBatch, PreferenceDataset};
use crate::error::{RapportError, Result};
use crate::model::{sequence_log_probs, RapportModel};
use crate::norm::log_sigmoid;
use crate::optimizer::{AdamW, GradAccumulator};
use crate::progress::{progress_bar, ProgressCallback, StepUpdate};
use crate::scheduler::LRScheduler;

/// Averages over one DPO epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DpoEpochRecord {
    /// 1-based epoch
    pub epoch: usize,
    /// Mean DPO loss
    pub loss: f64,
    /// Mean `beta * (pi_c - ref_c)`
    pub chosen_reward: f64,
    /// Mean `beta * (pi_r - ref_r)`
    pub rejected_reward: f64,
}

/// Per-batch DPO terms.
#[derive(Debug, Clone)]
pub struct DpoLoss {
    /// Scalar loss averaged over the batch
    pub loss: Tensor,
    /// `(batch,)` chosen rewards, detached
    pub chosen_rewards: Tensor,
    /// `(batch,)` rejected rewards, detached
    pub rejected_rewards: Tensor,
}

/// DPO loss from the four `(batch,)` sequence log-probabilities.
pub fn compute_dpo_loss(
    policy_chosen: &Tensor,
    policy_rejected: &Tensor,
    reference_chosen: &Tensor,
    reference_rejected: &Tensor,
    beta: f64,
) -> Result<DpoLoss> {
    let policy_margin = (policy_chosen - policy_rejected)?;
    let reference_margin = (reference_chosen - reference_rejected)?;
    let logits = ((policy_margin - reference_margin)? * beta)?;
    let loss = log_sigmoid(&logits)?.neg()?.mean_all()?;

    let chosen_rewards = ((policy_chosen - reference_chosen)? * beta)?.detach();
    let rejected_rewards = ((policy_rejected - reference_rejected)? * beta)?.detach();
    Ok(DpoLoss {
        loss,
        chosen_rewards,
        rejected_rewards,
    })
}

/// Policy/reference pair and the DPO update loop.
pub struct DpoTrainer {
    policy: RapportModel,
    reference: RapportModel,
    config: DpoConfig,
    checkpoints: CheckpointManager,
    seed: u64,
    global_step: usize,
}

impl DpoTrainer {
    /// Use a frozen snapshot of `policy` as the reference.
    pub fn new(
        policy: RapportModel,
        config: DpoConfig,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let reference = policy.frozen_copy()?;
        Self::with_reference(policy, reference, config, output_dir)
    }

    /// Use an explicit reference; it is frozen if it is not already.
    pub fn with_reference(
        policy: RapportModel,
        reference: RapportModel,
        config: DpoConfig,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        config.validate()?;
        if policy.params() != reference.params() {
            return Err(RapportError::config(
                "policy and reference must share an architecture",
            ));
        }
        let reference = if reference.is_frozen() {
            reference
        } else {
            reference.frozen_copy()?
        };
        Ok(Self {
            policy,
            reference,
            config,
            checkpoints: CheckpointManager::new(output_dir)?,
            seed: 42,
            global_step: 0,
        })
    }

    /// Seed for the per-epoch shuffle.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// The trainable model.
    pub fn policy(&self) -> &RapportModel {
        &self.policy
    }

    /// The frozen reference.
    pub fn reference(&self) -> &RapportModel {
        &self.reference
    }

    /// Give up the trained policy.
    pub fn into_policy(self) -> RapportModel {
        self.policy
    }

    /// Optimizer steps taken.
    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Where the final policy is written.
    pub fn output_dir(&self) -> &Path {
        self.checkpoints.output_dir()
    }

    /// DPO terms for one batch. Dropout is active on the policy when `train`.
    pub fn batch_loss(&self, batch: &PreferenceBatch, train: bool) -> Result<DpoLoss> {
        let policy_chosen = self.log_probs(&self.policy, &batch.chosen, train)?;
        let policy_rejected = self.log_probs(&self.policy, &batch.rejected, train)?;
        let reference_chosen = self.log_probs(&self.reference, &batch.chosen, false)?;
        let reference_rejected = self.log_probs(&self.reference, &batch.rejected, false)?;
        compute_dpo_loss(
            &policy_chosen,
            &policy_rejected,
            &reference_chosen,
            &reference_rejected,
            self.config.beta,
        )
    }

    fn log_probs(&self, model: &RapportModel, batch: &Batch, train: bool) -> Result<Tensor> {
        let logits = model.logits(&batch.input_ids, Some(&batch.attention_mask), train)?;
        sequence_log_probs(&logits, &batch.labels, model.params().pad_token_id)
    }

    /// Run all epochs, publish the policy as `dpo_model`, return per-epoch averages.
    pub fn train(
        &mut self,
        dataset: &PreferenceDataset,
        callback: &mut dyn ProgressCallback,
    ) -> Result<Vec<DpoEpochRecord>> {
        if dataset.is_empty() {
            return Err(RapportError::dataset("preference set is empty"));
        }
        let cfg = self.config.clone();
        let batches_per_epoch = num_batches(dataset.len(), cfg.batch_size);
        let total_steps = batches_per_epoch * cfg.num_epochs;

        tracing::info!("Starting DPO");
        tracing::info!("  Pairs: {}", dataset.len());
        tracing::info!("  Epochs: {}, beta: {}", cfg.num_epochs, cfg.beta);
        tracing::info!("  Optimizer steps: {}", total_steps);

        let params = self.policy.named_parameters()?;
        let mut optimizer = AdamW::new(cfg.learning_rate, cfg.weight_decay);
        let mut scheduler = LRScheduler::from_kind(
            cfg.lr_scheduler,
            cfg.learning_rate,
            cfg.warmup_steps,
            total_steps,
        );
        optimizer.set_learning_rate(scheduler.get_lr());
        let mut grads = GradAccumulator::new();

        let pb = progress_bar(total_steps, cfg.show_progress)?;
        let device = self.policy.device().clone();
        let mut history = Vec::with_capacity(cfg.num_epochs);

        for epoch in 0..cfg.num_epochs {
            let order = epoch_order(dataset.len(), self.seed, epoch);
            let mut loss_sum = 0f64;
            let mut chosen_sum = 0f64;
            let mut rejected_sum = 0f64;
            let mut batches = 0usize;

            for chunk in order.chunks(cfg.batch_size) {
                let pairs: Vec<_> = chunk.iter().map(|&i| &dataset.pairs()[i]).collect();
                let batch = collate_pairs(&pairs, &device)?;
                let terms = self.batch_loss(&batch, true)?;

                grads.accumulate(&params, &terms.loss.backward()?)?;
                grads.clip(cfg.max_grad_norm)?;
                optimizer.step(&params, grads.grads())?;
                scheduler.step(&mut optimizer);
                grads.clear();
                self.global_step += 1;

                let loss = terms.loss.to_scalar::<f32>()? as f64;
                loss_sum += loss;
                chosen_sum += terms.chosen_rewards.mean_all()?.to_scalar::<f32>()? as f64;
                rejected_sum += terms.rejected_rewards.mean_all()?.to_scalar::<f32>()? as f64;
                batches += 1;

                pb.set_message(format!("{loss:.4}"));
                pb.inc(1);
                callback.on_step(&StepUpdate {
                    step: self.global_step,
                    total_steps,
                    loss,
                    lr: optimizer.learning_rate(),
                    epoch,
                });
            }

            let record = DpoEpochRecord {
                epoch: epoch + 1,
                loss: loss_sum / batches as f64,
                chosen_reward: chosen_sum / batches as f64,
                rejected_reward: rejected_sum / batches as f64,
            };
            let line = format!(
                "DPO epoch {}/{}, Loss: {:.4}, Chosen reward: {:.4}, Rejected reward: {:.4}",
                record.epoch, cfg.num_epochs, record.loss, record.chosen_reward, record.rejected_reward
            );
            tracing::info!("{line}");
            callback.on_log(&line);
            history.push(record);
        }

        pb.finish_with_message("DPO complete");
        let state = TrainingState::new(self.global_step, cfg.num_epochs, None);
        self.checkpoints.save(DPO_MODEL, &self.policy, &state)?;
        Ok(history)
    }
}
