//! Text encoders feeding the model.
//!
//! The model only sees token ids; [`TextEncoder`] is the seam where a
//! tokenizer plugs in. [`ByteEncoder`] maps UTF-8 bytes to ids and needs no
//! files, [`HfTokenizer`] wraps a `tokenizers` JSON definition.

use std::path::Path;

use tokenizers::Tokenizer;

use crate::config::TokenizerConfig;
use crate::error::{RapportError, Result};

/// Converts between text and token ids.
pub trait TextEncoder: Send + Sync {
    /// Encode text without special tokens.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode ids, dropping special tokens.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// Padding id (also the ignore marker for labels).
    fn pad_id(&self) -> u32;

    /// End-of-sequence id.
    fn eos_id(&self) -> u32;

    /// Number of distinct ids the encoder can produce.
    fn vocab_size(&self) -> usize;
}

/// Byte-level encoder: three reserved ids followed by the 256 byte values.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteEncoder;

impl ByteEncoder {
    /// Padding id
    pub const PAD_ID: u32 = 0;
    /// End-of-sequence id
    pub const EOS_ID: u32 = 1;
    /// Beginning-of-sequence id
    pub const BOS_ID: u32 = 2;
    /// Id of byte 0
    pub const BYTE_OFFSET: u32 = 3;
    /// Reserved ids plus one id per byte
    pub const VOCAB_SIZE: usize = 256 + Self::BYTE_OFFSET as usize;
}

impl TextEncoder for ByteEncoder {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(|b| b as u32 + Self::BYTE_OFFSET).collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let bytes: Vec<u8> = ids
            .iter()
            .filter(|&&id| id >= Self::BYTE_OFFSET && (id as usize) < Self::VOCAB_SIZE)
            .map(|&id| (id - Self::BYTE_OFFSET) as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn pad_id(&self) -> u32 {
        Self::PAD_ID
    }

    fn eos_id(&self) -> u32 {
        Self::EOS_ID
    }

    fn vocab_size(&self) -> usize {
        Self::VOCAB_SIZE
    }
}

/// Wrapper over a `tokenizers` definition file.
pub struct HfTokenizer {
    inner: Tokenizer,
    pad_id: u32,
    eos_id: u32,
}

impl HfTokenizer {
    /// Load `tokenizer.json`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let inner = Tokenizer::from_file(path).map_err(|e| {
            RapportError::Tokenizer(format!("failed to load {}: {e}", path.display()))
        })?;

        let pad_id = ["<pad>", "[PAD]", "<|pad|>"]
            .iter()
            .find_map(|t| inner.token_to_id(t))
            .unwrap_or(0);
        let eos_id = ["</s>", "<|endoftext|>", "<eos>", "[SEP]"]
            .iter()
            .find_map(|t| inner.token_to_id(t))
            .unwrap_or(pad_id);

        tracing::debug!(pad_id, eos_id, "loaded tokenizer from {}", path.display());
        Ok(Self {
            inner,
            pad_id,
            eos_id,
        })
    }
}

impl TextEncoder for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.inner.encode(text, false)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(self.inner.decode(ids, true)?)
    }

    fn pad_id(&self) -> u32 {
        self.pad_id
    }

    fn eos_id(&self) -> u32 {
        self.eos_id
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

/// Build the encoder a configuration asks for.
pub fn load_encoder(config: &TokenizerConfig) -> Result<Box<dyn TextEncoder>> {
    match config {
        TokenizerConfig::Bytes => Ok(Box::new(ByteEncoder)),
        TokenizerConfig::File { path } => Ok(Box::new(HfTokenizer::from_file(path)?)),
    }
}
