//! Position-wise feed-forward sublayer.

use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

use crate::attention::linear;
use crate::config::ModelParameters;
use crate::embedding::dropout;

/// `dropout(fc2(dropout(gelu(fc1(x)))))` with a 4x expansion.
pub struct FeedForward {
    fc1: Linear,
    fc2: Linear,
    dropout: f32,
}

impl FeedForward {
    /// Create the sublayer under `fc1` and `fc2`.
    pub fn new(params: &ModelParameters, vb: VarBuilder) -> Result<Self> {
        let hidden = params.hidden_size;
        let intermediate = params.intermediate_size();
        Ok(Self {
            fc1: linear(hidden, intermediate, vb.pp("fc1"))?,
            fc2: linear(intermediate, hidden, vb.pp("fc2"))?,
            dropout: params.dropout,
        })
    }

    /// Forward pass
    /// Input: (batch, seq_len, hidden_size)
    /// Output: (batch, seq_len, hidden_size)
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.fc1.forward(x)?.gelu_erf()?;
        let h = dropout(&h, self.dropout, train)?;
        let out = self.fc2.forward(&h)?;
        dropout(&out, self.dropout, train)
    }
}
