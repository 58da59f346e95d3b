//! # rapport-lm
//!
//! A small decoder-only transformer for conversational coaching, with the
//! training and decoding machinery around it:
//! - Token and positional embeddings, causal multi-head attention, pre-norm
//!   blocks and an output projection tied to the embedding table
//! - Sampling with repetition penalty, temperature, top-k and top-p
//! - Supervised fine-tuning with gradient accumulation, a linear warmup and
//!   decay schedule, dynamic loss scaling and resumable checkpoints
//! - Direct preference optimization against a frozen reference
//! - A single-job background training service
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! rapport init config.yaml --preset tiny
//! rapport sample-data ./data
//! rapport sft config.yaml
//! rapport generate config.yaml "How do I apologize?" --checkpoint ./checkpoints/checkpoint_final
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use candle_core::Device;
//! use rapport_lm::{ByteEncoder, GenerationConfig, Generator, ModelParameters, RapportModel, TextEncoder};
//!
//! # fn main() -> rapport_lm::Result<()> {
//! let model = RapportModel::new(&ModelParameters::tiny(), &Device::Cpu)?;
//! let prompt = ByteEncoder.encode("Hello")?;
//! let mut generator = Generator::new(&model, GenerationConfig::greedy(8))?;
//! let reply = generator.complete(&prompt)?;
//! println!("{}", ByteEncoder.decode(&reply)?);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod attention;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod dpo;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod job;
pub mod layer;
pub mod mlp;
pub mod model;
pub mod norm;
pub mod optimizer;
pub mod progress;
pub mod scheduler;
pub mod tokenizer;
pub mod trainer;

pub use checkpoint::{CheckpointManager, TrainingState};
pub use config::{DpoConfig, ModelParameters, RapportConfig, TrainingConfig};
pub use data::{PreferenceDataset, SftDataset};
pub use dpo::{compute_dpo_loss, DpoEpochRecord, DpoTrainer};
pub use error::{RapportError, Result};
pub use generation::{GenerationConfig, Generator, SequenceState};
pub use job::{JobHandle, JobState, JobStatus, TrainingEvent, TrainingService};
pub use model::{ModelOutput, RapportModel};
pub use progress::{NoProgress, ProgressCallback, StepUpdate};
pub use scheduler::{LRScheduler, ScheduleKind};
pub use tokenizer::{ByteEncoder, HfTokenizer, TextEncoder};
pub use trainer::{HistoryRecord, SftTrainer};
