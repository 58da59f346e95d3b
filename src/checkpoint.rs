//! Checkpoint directories.
//!
//! A checkpoint is a directory holding:
//!
//! | File                  | Content                                        |
//! |-----------------------|------------------------------------------------|
//! | `model.safetensors`   | all parameters, tied embedding stored once     |
//! | `config.json`         | [`ModelParameters`] to rebuild the architecture |
//! | `training_state.json` | [`TrainingState`]                              |
//!
//! Directories are written under a hidden temporary name and renamed into
//! place once complete, so a crash never leaves a half-written checkpoint
//! under a published name.

use std::fs;
use std::path::{Path, PathBuf};

use candle_core::Device;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ModelParameters;
use crate::error::{RapportError, Result};
use crate::model::RapportModel;

/// Weights file name.
pub const WEIGHTS_FILE: &str = "model.safetensors";
/// Architecture file name.
pub const CONFIG_FILE: &str = "config.json";
/// Counters file name.
pub const STATE_FILE: &str = "training_state.json";

/// Checkpoint published when an SFT run ends.
pub const FINAL_CHECKPOINT: &str = "checkpoint_final";
/// Checkpoint with the lowest evaluation loss.
pub const BEST_CHECKPOINT: &str = "checkpoint_best";
/// Policy published when a DPO run ends.
pub const DPO_MODEL: &str = "dpo_model";

/// Name of the periodic checkpoint after `step` optimizer steps.
pub fn step_checkpoint(step: usize) -> String {
    format!("checkpoint_step_{step}")
}

/// Name of the checkpoint after epoch `epoch` (1-based).
pub fn epoch_checkpoint(epoch: usize) -> String {
    format!("checkpoint_epoch_{epoch}")
}

/// Counters restored on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Optimizer steps taken
    pub global_step: usize,
    /// Epochs fully completed
    pub epoch: usize,
    /// Lowest evaluation loss seen, if any evaluation ran
    pub best_eval_loss: Option<f64>,
    /// When the checkpoint was written
    pub timestamp: DateTime<Utc>,
}

impl TrainingState {
    /// State stamped with the current time.
    pub fn new(global_step: usize, epoch: usize, best_eval_loss: Option<f64>) -> Self {
        Self {
            global_step,
            epoch,
            best_eval_loss,
            timestamp: Utc::now(),
        }
    }
}

/// Writes and reads checkpoint directories under one output directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    output_dir: PathBuf,
}

impl CheckpointManager {
    /// Manager rooted at `output_dir`, created if missing.
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir)?;
        Ok(Self { output_dir })
    }

    /// Root directory.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Path of a named checkpoint.
    pub fn path(&self, name: &str) -> PathBuf {
        self.output_dir.join(name)
    }

    /// Publish `model` and `state` as `output_dir/name`, replacing any
    /// previous checkpoint of that name.
    pub fn save(&self, name: &str, model: &RapportModel, state: &TrainingState) -> Result<PathBuf> {
        let path = self.path(name);
        save_checkpoint(&path, model, state)?;
        Ok(path)
    }

    /// Load a checkpoint directory.
    pub fn load(path: impl AsRef<Path>, device: &Device) -> Result<(RapportModel, TrainingState)> {
        load_checkpoint(path.as_ref(), device)
    }
}

/// Write a complete checkpoint to `path` atomically.
pub fn save_checkpoint(path: &Path, model: &RapportModel, state: &TrainingState) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| RapportError::checkpoint(format!("invalid checkpoint path {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let staging = parent.join(format!(".{name}.tmp"));
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;

    let written = write_contents(&staging, model, state);
    if let Err(e) = written {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }

    if path.exists() {
        let retired = parent.join(format!(".{name}.old"));
        if retired.exists() {
            fs::remove_dir_all(&retired)?;
        }
        fs::rename(path, &retired)?;
        fs::rename(&staging, path)?;
        fs::remove_dir_all(&retired)?;
    } else {
        fs::rename(&staging, path)?;
    }

    tracing::info!(
        "Saved checkpoint to {} (step={}, epoch={})",
        path.display(),
        state.global_step,
        state.epoch
    );
    Ok(())
}

fn write_contents(dir: &Path, model: &RapportModel, state: &TrainingState) -> Result<()> {
    model.save_weights(&dir.join(WEIGHTS_FILE))?;
    fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(model.params())?)?;
    fs::write(dir.join(STATE_FILE), serde_json::to_string_pretty(state)?)?;
    Ok(())
}

/// Read only the counters of a checkpoint.
pub fn load_state(path: &Path) -> Result<TrainingState> {
    let state_path = path.join(STATE_FILE);
    let json = fs::read_to_string(&state_path).map_err(|e| {
        RapportError::checkpoint(format!("failed to read {}: {e}", state_path.display()))
    })?;
    Ok(serde_json::from_str(&json)?)
}

/// Read only the architecture of a checkpoint.
pub fn load_params(path: &Path) -> Result<ModelParameters> {
    let config_path = path.join(CONFIG_FILE);
    let json = fs::read_to_string(&config_path).map_err(|e| {
        RapportError::checkpoint(format!("failed to read {}: {e}", config_path.display()))
    })?;
    let params: ModelParameters = serde_json::from_str(&json)?;
    params.validate()?;
    Ok(params)
}

/// Rebuild the model declared in `config.json` and load its weights strictly.
pub fn load_checkpoint(path: &Path, device: &Device) -> Result<(RapportModel, TrainingState)> {
    if !path.is_dir() {
        return Err(RapportError::checkpoint(format!(
            "checkpoint directory {} does not exist",
            path.display()
        )));
    }
    let params = load_params(path)?;
    let model = RapportModel::new(&params, device)?;
    model.load_weights(&path.join(WEIGHTS_FILE))?;
    let state = load_state(path)?;

    tracing::info!(
        "Loaded checkpoint from {} (step={}, epoch={})",
        path.display(),
        state.global_step,
        state.epoch
    );
    Ok((model, state))
}
