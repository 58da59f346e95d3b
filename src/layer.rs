//! Pre-norm transformer block.
//!
//! `x = x + attention(ln1(x))`, then `x = x + feed_forward(ln2(x))`.

use candle_core::{Result, Tensor};
use candle_nn::{Module, VarBuilder};

use crate::attention::CausalSelfAttention;
use crate::config::ModelParameters;
use crate::mlp::FeedForward;
use crate::norm::{layer_norm, LayerNorm};

/// Single transformer block
pub struct TransformerBlock {
    ln1: LayerNorm,
    attention: CausalSelfAttention,
    ln2: LayerNorm,
    feed_forward: FeedForward,
}

impl TransformerBlock {
    /// Create a block under `ln1`, `attention`, `ln2`, `feed_forward`.
    pub fn new(params: &ModelParameters, vb: VarBuilder) -> Result<Self> {
        let eps = params.layer_norm_eps;
        Ok(Self {
            ln1: layer_norm(params.hidden_size, eps, vb.pp("ln1"))?,
            attention: CausalSelfAttention::new(params, vb.pp("attention"))?,
            ln2: layer_norm(params.hidden_size, eps, vb.pp("ln2"))?,
            feed_forward: FeedForward::new(params, vb.pp("feed_forward"))?,
        })
    }

    /// Forward pass
    /// Input: (batch, seq_len, hidden_size)
    /// Output: (batch, seq_len, hidden_size)
    pub fn forward(
        &self,
        x: &Tensor,
        causal_mask: &Tensor,
        padding_bias: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let attn_out =
            self.attention
                .forward(&self.ln1.forward(x)?, causal_mask, padding_bias, train)?;
        let x = (x + attn_out)?;

        let ffn_out = self.feed_forward.forward(&self.ln2.forward(&x)?, train)?;
        &x + ffn_out
    }
}
