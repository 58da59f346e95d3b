//! Error types for rapport-lm.
//!
//! Every fallible operation in the crate returns [`Result`], whose error
//! side is [`RapportError`].
//!
//! # Example
//!
//! ```rust
//! use rapport_lm::{ModelParameters, RapportError};
//!
//! let mut params = ModelParameters::tiny();
//! params.num_heads = 5;
//! match params.validate() {
//!     Err(RapportError::Config(msg)) => assert!(msg.contains("divisible")),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use thiserror::Error;

/// Result type alias for rapport-lm operations.
pub type Result<T> = std::result::Result<T, RapportError>;

/// Errors that can occur in rapport-lm.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RapportError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid YAML configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// A dataset file produced no usable examples.
    #[error("dataset empty: no usable examples in {path}")]
    DatasetEmpty {
        /// Path of the dataset file
        path: String,
    },

    /// A stored tensor does not match the declared architecture.
    #[error("shape mismatch for {name}: expected {expected}, got {got}")]
    ShapeMismatch {
        /// Parameter name
        name: String,
        /// Shape implied by the model parameters
        expected: String,
        /// Shape found in the checkpoint
        got: String,
    },

    /// A parameter required by the architecture is missing from a checkpoint.
    #[error("checkpoint is missing tensor {0}")]
    MissingTensor(String),

    /// A checkpoint carries a tensor the architecture does not declare.
    #[error("checkpoint has unexpected tensor {0}")]
    UnexpectedTensor(String),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// A training job is already running.
    #[error("a training run is already in progress")]
    TrainingInProgress,

    /// Generation error.
    #[error("generation error: {0}")]
    Generation(String),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl RapportError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a dataset error
    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a training error
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    /// Create a generation error
    pub fn generation(msg: impl Into<String>) -> Self {
        Self::Generation(msg.into())
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(
        name: impl Into<String>,
        expected: impl std::fmt::Debug,
        got: impl std::fmt::Debug,
    ) -> Self {
        Self::ShapeMismatch {
            name: name.into(),
            expected: format!("{expected:?}"),
            got: format!("{got:?}"),
        }
    }
}

impl From<indicatif::style::TemplateError> for RapportError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        RapportError::Template(err.to_string())
    }
}

impl From<tokenizers::Error> for RapportError {
    fn from(err: tokenizers::Error) -> Self {
        RapportError::Tokenizer(err.to_string())
    }
}
