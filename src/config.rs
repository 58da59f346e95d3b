//! Configuration parsing and validation.
//!
//! [`ModelParameters`] describes the architecture and is stored next to
//! every checkpoint. [`RapportConfig`] is the YAML document driving the CLI.

use std::path::Path;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{RapportError, Result};
use crate::generation::GenerationConfig;
use crate::scheduler::ScheduleKind;

/// Architecture hyperparameters of a [`crate::RapportModel`].
///
/// Immutable for the lifetime of a model; a different architecture needs a
/// new model instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    /// Vocabulary size
    pub vocab_size: usize,
    /// Hidden dimension
    pub hidden_size: usize,
    /// Number of transformer blocks
    pub num_layers: usize,
    /// Number of attention heads
    pub num_heads: usize,
    /// Maximum context length (number of learned positions)
    pub max_length: usize,
    /// Dropout probability used during training
    pub dropout: f32,
    /// Padding token id; label positions holding it are ignored by the loss
    pub pad_token_id: u32,
    /// Layer norm epsilon
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self::base()
    }
}

impl ModelParameters {
    /// GPT-2 sized configuration (768 hidden, 12 layers, 12 heads).
    pub fn base() -> Self {
        Self {
            vocab_size: 50257,
            hidden_size: 768,
            num_layers: 12,
            num_heads: 12,
            max_length: 512,
            dropout: 0.1,
            pad_token_id: 0,
            layer_norm_eps: 1e-5,
        }
    }

    /// A few million parameters, trainable on a laptop CPU.
    pub fn small() -> Self {
        Self {
            vocab_size: 32000,
            hidden_size: 256,
            num_layers: 4,
            num_heads: 4,
            max_length: 256,
            dropout: 0.1,
            pad_token_id: 0,
            layer_norm_eps: 1e-5,
        }
    }

    /// Test-scale configuration sized for the byte-level encoder.
    pub fn tiny() -> Self {
        Self {
            vocab_size: crate::tokenizer::ByteEncoder::VOCAB_SIZE,
            hidden_size: 32,
            num_layers: 2,
            num_heads: 4,
            max_length: 32,
            dropout: 0.0,
            pad_token_id: crate::tokenizer::ByteEncoder::PAD_ID,
            layer_norm_eps: 1e-5,
        }
    }

    /// Look up a named preset (`tiny`, `small`, `base`).
    pub fn from_preset(name: &str) -> Result<Self> {
        match name {
            "tiny" => Ok(Self::tiny()),
            "small" => Ok(Self::small()),
            "base" => Ok(Self::base()),
            _ => Err(RapportError::config(format!("unknown preset: {name}"))),
        }
    }

    /// Dimension of each attention head.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    /// Width of the feed-forward expansion.
    pub fn intermediate_size(&self) -> usize {
        4 * self.hidden_size
    }

    /// Number of trainable scalars (the tied output projection is counted once).
    pub fn parameter_count(&self) -> usize {
        let h = self.hidden_size;
        let embeddings = self.vocab_size * h + self.max_length * h;
        let attention = 4 * (h * h + h);
        let ffn = h * self.intermediate_size() + self.intermediate_size() + self.intermediate_size() * h + h;
        let norms = 2 * 2 * h;
        embeddings + self.num_layers * (attention + ffn + norms) + 2 * h
    }

    /// Check the architecture invariants.
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.hidden_size == 0 || self.num_heads == 0 {
            return Err(RapportError::config(
                "vocab_size, hidden_size and num_heads must be positive",
            ));
        }
        if self.max_length < 2 {
            return Err(RapportError::config("max_length must be at least 2"));
        }
        if self.hidden_size % self.num_heads != 0 {
            return Err(RapportError::config(format!(
                "hidden_size ({}) must be divisible by num_heads ({})",
                self.hidden_size, self.num_heads
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(RapportError::config("dropout must be in [0, 1)"));
        }
        if self.pad_token_id as usize >= self.vocab_size {
            return Err(RapportError::config("pad_token_id must be below vocab_size"));
        }
        Ok(())
    }
}

/// Main configuration document.
///
/// # Example
///
/// ```rust
/// use rapport_lm::RapportConfig;
///
/// # fn main() -> rapport_lm::Result<()> {
/// let mut config = RapportConfig::from_preset("tiny")?;
/// config.training.num_epochs = 1;
/// config.validate()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RapportConfig {
    /// Model architecture.
    #[serde(default)]
    pub model: ModelParameters,

    /// Tokenizer provider.
    #[serde(default)]
    pub tokenizer: TokenizerConfig,

    /// Dataset locations.
    #[serde(default)]
    pub dataset: DatasetConfig,

    /// SFT hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,

    /// DPO hyperparameters.
    #[serde(default)]
    pub dpo: DpoConfig,

    /// Sampling defaults.
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Output directory for checkpoints.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Random seed.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Compute device (`cpu` or `cuda`).
    #[serde(default = "default_device")]
    pub device: String,
}

fn default_output_dir() -> String {
    "./checkpoints".into()
}

fn default_seed() -> u64 {
    42
}

fn default_device() -> String {
    "cpu".into()
}

/// Tokenizer provider selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TokenizerConfig {
    /// Fixed byte-level encoder.
    #[default]
    Bytes,
    /// `tokenizers` JSON file.
    File {
        /// Path to `tokenizer.json`
        path: String,
    },
}

/// Dataset file locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// SFT training records (`instruction`/`input`/`output`)
    #[serde(default = "default_train_path")]
    pub train_path: String,
    /// Optional SFT evaluation records
    #[serde(default)]
    pub eval_path: Option<String>,
    /// Preference records (`prompt`/`chosen`/`rejected`)
    #[serde(default = "default_preference_path")]
    pub preference_path: String,
}

fn default_train_path() -> String {
    "./data/sft_data.jsonl".into()
}

fn default_preference_path() -> String {
    "./data/preference_data.jsonl".into()
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            train_path: default_train_path(),
            eval_path: None,
            preference_path: default_preference_path(),
        }
    }
}

/// Supervised fine-tuning hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of epochs
    #[serde(default = "default_epochs")]
    pub num_epochs: usize,
    /// Micro-batch size
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Micro-batches per optimizer step
    #[serde(default = "default_grad_accum")]
    pub gradient_accumulation_steps: usize,
    /// Peak learning rate
    #[serde(default = "default_lr")]
    pub learning_rate: f64,
    /// Decoupled weight decay
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// Linear warmup steps
    #[serde(default = "default_warmup")]
    pub warmup_steps: usize,
    /// Shape of the learning rate after warmup
    #[serde(default)]
    pub lr_scheduler: ScheduleKind,
    /// Global gradient norm ceiling
    #[serde(default = "default_grad_norm")]
    pub max_grad_norm: f64,
    /// Checkpoint every N optimizer steps
    #[serde(default = "default_save_steps")]
    pub save_steps: usize,
    /// Evaluate every N optimizer steps
    #[serde(default = "default_eval_steps")]
    pub eval_steps: usize,
    /// Log every N optimizer steps
    #[serde(default = "default_log_steps")]
    pub logging_steps: usize,
    /// Dynamic loss scaling
    #[serde(default = "default_true")]
    pub mixed_precision: bool,
    /// Batches assembled ahead by the loader thread (0 disables prefetch)
    #[serde(default = "default_prefetch")]
    pub prefetch_batches: usize,
    /// Draw a terminal progress bar
    #[serde(default = "default_true")]
    pub show_progress: bool,
}

fn default_epochs() -> usize {
    3
}
fn default_batch_size() -> usize {
    4
}
fn default_grad_accum() -> usize {
    8
}
fn default_lr() -> f64 {
    2e-5
}
fn default_weight_decay() -> f64 {
    0.01
}
fn default_warmup() -> usize {
    500
}
fn default_grad_norm() -> f64 {
    1.0
}
fn default_save_steps() -> usize {
    500
}
fn default_eval_steps() -> usize {
    100
}
fn default_log_steps() -> usize {
    10
}
fn default_true() -> bool {
    true
}
fn default_prefetch() -> usize {
    2
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_epochs: default_epochs(),
            batch_size: default_batch_size(),
            gradient_accumulation_steps: default_grad_accum(),
            learning_rate: default_lr(),
            weight_decay: default_weight_decay(),
            warmup_steps: default_warmup(),
            lr_scheduler: ScheduleKind::default(),
            max_grad_norm: default_grad_norm(),
            save_steps: default_save_steps(),
            eval_steps: default_eval_steps(),
            logging_steps: default_log_steps(),
            mixed_precision: true,
            prefetch_batches: default_prefetch(),
            show_progress: true,
        }
    }
}

impl TrainingConfig {
    /// Check ranges.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.gradient_accumulation_steps == 0 {
            return Err(RapportError::config(
                "batch_size and gradient_accumulation_steps must be at least 1",
            ));
        }
        if self.save_steps == 0 || self.eval_steps == 0 || self.logging_steps == 0 {
            return Err(RapportError::config(
                "save_steps, eval_steps and logging_steps must be at least 1",
            ));
        }
        if self.learning_rate < 0.0 || self.weight_decay < 0.0 || self.max_grad_norm <= 0.0 {
            return Err(RapportError::config(
                "learning_rate and weight_decay must be non-negative, max_grad_norm positive",
            ));
        }
        Ok(())
    }
}

/// Direct preference optimization hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpoConfig {
    /// Preference strength
    #[serde(default = "default_beta")]
    pub beta: f64,
    /// Number of epochs
    #[serde(default = "default_dpo_epochs")]
    pub num_epochs: usize,
    /// Preference pairs per optimizer step
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Peak learning rate
    #[serde(default = "default_dpo_lr")]
    pub learning_rate: f64,
    /// Decoupled weight decay
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// Linear warmup steps
    #[serde(default = "default_warmup")]
    pub warmup_steps: usize,
    /// Shape of the learning rate after warmup
    #[serde(default)]
    pub lr_scheduler: ScheduleKind,
    /// Global gradient norm ceiling
    #[serde(default = "default_grad_norm")]
    pub max_grad_norm: f64,
    /// Draw a terminal progress bar
    #[serde(default = "default_true")]
    pub show_progress: bool,
}

fn default_beta() -> f64 {
    0.1
}
fn default_dpo_epochs() -> usize {
    1
}
fn default_dpo_lr() -> f64 {
    5e-7
}

impl Default for DpoConfig {
    fn default() -> Self {
        Self {
            beta: default_beta(),
            num_epochs: default_dpo_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_dpo_lr(),
            weight_decay: default_weight_decay(),
            warmup_steps: default_warmup(),
            lr_scheduler: ScheduleKind::default(),
            max_grad_norm: default_grad_norm(),
            show_progress: true,
        }
    }
}

impl DpoConfig {
    /// Check ranges.
    pub fn validate(&self) -> Result<()> {
        if self.beta <= 0.0 {
            return Err(RapportError::config("dpo beta must be positive"));
        }
        if self.batch_size == 0 {
            return Err(RapportError::config("dpo batch_size must be at least 1"));
        }
        if self.max_grad_norm <= 0.0 {
            return Err(RapportError::config("dpo max_grad_norm must be positive"));
        }
        Ok(())
    }
}

impl Default for RapportConfig {
    fn default() -> Self {
        Self {
            model: ModelParameters::default(),
            tokenizer: TokenizerConfig::default(),
            dataset: DatasetConfig::default(),
            training: TrainingConfig::default(),
            dpo: DpoConfig::default(),
            generation: GenerationConfig::default(),
            output_dir: default_output_dir(),
            seed: default_seed(),
            device: default_device(),
        }
    }
}

impl RapportConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration around a model preset.
    ///
    /// The `tiny` preset also shrinks the run so it finishes in seconds.
    pub fn from_preset(preset: &str) -> Result<Self> {
        let model = ModelParameters::from_preset(preset)?;
        let mut config = Self {
            model,
            ..Default::default()
        };
        if preset == "tiny" {
            config.training = TrainingConfig {
                num_epochs: 1,
                batch_size: 2,
                gradient_accumulation_steps: 1,
                learning_rate: 1e-3,
                warmup_steps: 2,
                save_steps: 50,
                eval_steps: 10,
                logging_steps: 1,
                ..Default::default()
            };
            config.dpo.warmup_steps = 0;
            config.dpo.learning_rate = 1e-4;
            config.generation.max_new_tokens = 16;
        }
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.training.validate()?;
        self.dpo.validate()?;
        self.generation.validate()?;
        if self.output_dir.is_empty() {
            return Err(RapportError::config("output_dir cannot be empty"));
        }
        Ok(())
    }

    /// Resolve the configured compute device.
    pub fn device(&self) -> Result<Device> {
        match self.device.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => match Device::cuda_if_available(0)? {
                device @ Device::Cuda(_) => {
                    tracing::info!("Compute device: CUDA");
                    Ok(device)
                }
                _ => {
                    tracing::warn!("CUDA not available; falling back to CPU");
                    Ok(Device::Cpu)
                }
            },
            other => Err(RapportError::config(format!("unknown device: {other}"))),
        }
    }
}
