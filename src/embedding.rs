//! Token plus learned positional embeddings.

use candle_core::{DType, Result, Tensor};
use candle_nn::{Embedding, Init, Module, VarBuilder};

use crate::config::ModelParameters;

/// Standard deviation of the normal initializer shared by all projections.
pub const INIT_STD: f64 = 0.02;

/// Embedding stage: `dropout(token_embedding[id] + position_embedding[pos])`.
pub struct EmbeddingStage {
    token_embedding: Embedding,
    position_embedding: Embedding,
    token_weight: Tensor,
    hidden_size: usize,
    max_length: usize,
    dropout: f32,
}

impl EmbeddingStage {
    /// Create the stage; parameters live under `token_embedding` and `position_embedding`.
    pub fn new(params: &ModelParameters, vb: VarBuilder) -> Result<Self> {
        let init = Init::Randn {
            mean: 0.0,
            stdev: INIT_STD,
        };
        let token_weight = vb.pp("token_embedding").get_with_hints(
            (params.vocab_size, params.hidden_size),
            "weight",
            init,
        )?;
        let position_weight = vb.pp("position_embedding").get_with_hints(
            (params.max_length, params.hidden_size),
            "weight",
            init,
        )?;

        Ok(Self {
            token_embedding: Embedding::new(token_weight.clone(), params.hidden_size),
            position_embedding: Embedding::new(position_weight, params.hidden_size),
            token_weight,
            hidden_size: params.hidden_size,
            max_length: params.max_length,
            dropout: params.dropout,
        })
    }

    /// The token table, shared with the output projection.
    pub fn token_weight(&self) -> &Tensor {
        &self.token_weight
    }

    /// Embed `(batch, seq_len)` ids into `(batch, seq_len, hidden)`.
    ///
    /// Token ids must be below `vocab_size`; `seq_len` must not exceed `max_length`.
    pub fn forward(&self, input_ids: &Tensor, train: bool) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        if seq_len > self.max_length {
            candle_core::bail!(
                "sequence length {seq_len} exceeds max_length {}",
                self.max_length
            );
        }

        let tokens = self.token_embedding.forward(input_ids)?;
        let positions = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let positions = self
            .position_embedding
            .forward(&positions)?
            .reshape((1, seq_len, self.hidden_size))?;

        let hidden = tokens.broadcast_add(&positions)?;
        dropout(&hidden, self.dropout, train)
    }
}

/// Inverted dropout during training, identity otherwise.
pub fn dropout(x: &Tensor, p: f32, train: bool) -> Result<Tensor> {
    if train && p > 0.0 {
        candle_nn::ops::dropout(x, p)
    } else {
        Ok(x.clone())
    }
}

/// Convert a slice of rows into a `(rows, cols)` u32 tensor.
pub fn ids_tensor(rows: &[Vec<u32>], device: &candle_core::Device) -> Result<Tensor> {
    let cols = rows.first().map(Vec::len).unwrap_or(0);
    if rows.iter().any(|r| r.len() != cols) {
        candle_core::bail!("all rows must have the same length");
    }
    let flat: Vec<u32> = rows.iter().flatten().copied().collect();
    Tensor::from_vec(flat, (rows.len(), cols), device)?.to_dtype(DType::U32)
}
