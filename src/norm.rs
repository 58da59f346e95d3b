//! Layer normalization and softmax built from elementary tensor ops.
//!
//! Every op used here has a backward pass on every candle backend, so the
//! whole model stays differentiable on CPU and CUDA alike.

use candle_core::{Result, Tensor, D};
use candle_nn::{Init, Module, VarBuilder};

/// LayerNorm over the last dimension: `(x - mean) / sqrt(var + eps) * weight + bias`.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    /// Create a LayerNorm from existing parameters.
    pub fn new(weight: Tensor, bias: Tensor, eps: f64) -> Self {
        Self { weight, bias, eps }
    }

    /// Width of the normalized dimension.
    pub fn size(&self) -> usize {
        self.weight.dims()[0]
    }
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let std = (var + self.eps)?.sqrt()?;
        centered
            .broadcast_div(&std)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

/// Create a LayerNorm with unit scale and zero shift.
pub fn layer_norm(size: usize, eps: f64, vb: VarBuilder) -> Result<LayerNorm> {
    let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
    let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
    Ok(LayerNorm::new(weight, bias, eps))
}

/// Softmax over the last dimension.
///
/// Rows may contain `-inf`; those entries come out as exact zeros as long as
/// each row has at least one finite score.
pub fn softmax_last_dim(x: &Tensor) -> Result<Tensor> {
    // The shift does not change the result, so it carries no gradient.
    let max = x.max_keepdim(D::Minus1)?.detach();
    let exp = x.broadcast_sub(&max)?.exp()?;
    let sum = exp.sum_keepdim(D::Minus1)?;
    exp.broadcast_div(&sum)
}

/// Log-softmax over the last dimension.
pub fn log_softmax_last_dim(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?.detach();
    let shifted = x.broadcast_sub(&max)?;
    let log_sum_exp = shifted.exp()?.sum_keepdim(D::Minus1)?.log()?;
    shifted.broadcast_sub(&log_sum_exp)
}

/// `log(sigmoid(x))` evaluated as `-(relu(-x) + log(1 + exp(-|x|)))`.
pub fn log_sigmoid(x: &Tensor) -> Result<Tensor> {
    let softplus_neg = (x.neg()?.relu()? + (x.abs()?.neg()?.exp()? + 1.0)?.log()?)?;
    softplus_neg.neg()
}
