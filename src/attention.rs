//! Multi-head causal self-attention.

use candle_core::{Device, Result, Tensor};
use candle_nn::{Init, Linear, Module, VarBuilder};

use crate::config::ModelParameters;
use crate::embedding::{dropout, INIT_STD};
use crate::norm::softmax_last_dim;

/// Bias added to scores of padded key positions.
pub const PADDING_BIAS: f64 = -10000.0;

/// Linear layer with N(0, 0.02) weights and zero bias.
pub fn linear(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: INIT_STD,
        },
    )?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Scaled dot-product attention over `num_heads` heads.
pub struct CausalSelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    dropout: f32,
}

impl CausalSelfAttention {
    /// Create attention projections under `q_proj`, `k_proj`, `v_proj`, `out_proj`.
    pub fn new(params: &ModelParameters, vb: VarBuilder) -> Result<Self> {
        if params.num_heads == 0 || params.hidden_size % params.num_heads != 0 {
            candle_core::bail!(
                "hidden_size ({}) must be divisible by num_heads ({})",
                params.hidden_size,
                params.num_heads
            );
        }
        let hidden = params.hidden_size;

        Ok(Self {
            q_proj: linear(hidden, hidden, vb.pp("q_proj"))?,
            k_proj: linear(hidden, hidden, vb.pp("k_proj"))?,
            v_proj: linear(hidden, hidden, vb.pp("v_proj"))?,
            out_proj: linear(hidden, hidden, vb.pp("out_proj"))?,
            num_heads: params.num_heads,
            head_dim: params.head_dim(),
            dropout: params.dropout,
        })
    }

    /// Forward pass
    /// Input: (batch, seq_len, hidden_size)
    /// Output: (batch, seq_len, hidden_size)
    ///
    /// `causal_mask` is the additive `(1, 1, seq, seq)` mask from
    /// [`create_causal_mask`]; `padding_bias` is `(batch, 1, 1, seq)`.
    pub fn forward(
        &self,
        x: &Tensor,
        causal_mask: &Tensor,
        padding_bias: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        Ok(self.forward_with_weights(x, causal_mask, padding_bias, train)?.0)
    }

    /// Forward pass that also returns the post-softmax weights
    /// `(batch, num_heads, seq, seq)`, before dropout.
    pub fn forward_with_weights(
        &self,
        x: &Tensor,
        causal_mask: &Tensor,
        padding_bias: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (batch, seq_len, hidden) = x.dims3()?;

        let q = self.split_heads(&self.q_proj.forward(x)?, batch, seq_len)?;
        let k = self.split_heads(&self.k_proj.forward(x)?, batch, seq_len)?;
        let v = self.split_heads(&self.v_proj.forward(x)?, batch, seq_len)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let mut scores = (q.matmul(&k.t()?)? * scale)?;
        scores = scores.broadcast_add(causal_mask)?;
        if let Some(bias) = padding_bias {
            scores = scores.broadcast_add(bias)?;
        }

        let weights = softmax_last_dim(&scores)?;
        let attended = dropout(&weights, self.dropout, train)?.matmul(&v)?;

        // (batch, heads, seq, head_dim) -> (batch, seq, hidden)
        let merged = attended
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, hidden))?;
        let out = self.out_proj.forward(&merged)?;
        Ok((dropout(&out, self.dropout, train)?, weights))
    }

    fn split_heads(&self, x: &Tensor, batch: usize, seq_len: usize) -> Result<Tensor> {
        x.reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }
}

/// Additive causal mask of shape `(1, 1, seq_len, seq_len)`: 0 on and below
/// the diagonal, `-inf` above it.
pub fn create_causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)
}

/// Turn a `(batch, seq_len)` 1/0 attention mask into an additive
/// `(batch, 1, 1, seq_len)` bias.
pub fn padding_bias(attention_mask: &Tensor) -> Result<Tensor> {
    let (batch, seq_len) = attention_mask.dims2()?;
    let mask = attention_mask.to_dtype(candle_core::DType::F32)?;
    let bias = ((mask.ones_like()? - mask)? * PADDING_BIAS)?;
    bias.reshape((batch, 1, 1, seq_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn attention(params: &ModelParameters) -> CausalSelfAttention {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        CausalSelfAttention::new(params, vb).unwrap()
    }

    #[test]
    fn test_output_shape_matches_input_for_valid_head_splits() {
        for (hidden, heads) in [(8, 1), (8, 2), (12, 3), (16, 4), (32, 8)] {
            let params = ModelParameters {
                hidden_size: hidden,
                num_heads: heads,
                ..ModelParameters::tiny()
            };
            let attn = attention(&params);
            let x = Tensor::randn(0.0f32, 1.0, (2, 5, hidden), &Device::Cpu).unwrap();
            let mask = create_causal_mask(5, &Device::Cpu).unwrap();
            let out = attn.forward(&x, &mask, None, false).unwrap();
            assert_eq!(out.dims(), x.dims(), "hidden={hidden} heads={heads}");
        }
    }

    #[test]
    fn test_future_positions_get_exactly_zero_weight() {
        let params = ModelParameters::tiny();
        let attn = attention(&params);
        let seq = 7;
        let x = Tensor::randn(0.0f32, 3.0, (2, seq, params.hidden_size), &Device::Cpu).unwrap();
        let mask = create_causal_mask(seq, &Device::Cpu).unwrap();
        let (_, weights) = attn.forward_with_weights(&x, &mask, None, false).unwrap();

        let weights: Vec<f32> = weights.flatten_all().unwrap().to_vec1().unwrap();
        for (idx, w) in weights.iter().enumerate() {
            let i = (idx / seq) % seq;
            let j = idx % seq;
            if j > i {
                assert_eq!(*w, 0.0, "position {i} attends to future {j}");
            } else {
                assert!(*w >= 0.0);
            }
        }
    }

    #[test]
    fn test_rows_sum_to_one() {
        let params = ModelParameters::tiny();
        let attn = attention(&params);
        let x = Tensor::randn(0.0f32, 1.0, (1, 4, params.hidden_size), &Device::Cpu).unwrap();
        let mask = create_causal_mask(4, &Device::Cpu).unwrap();
        let (_, weights) = attn.forward_with_weights(&x, &mask, None, false).unwrap();
        let sums: Vec<f32> = weights
            .sum(candle_core::D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
    }

    #[test]
    fn test_padded_keys_are_suppressed() {
        let params = ModelParameters::tiny();
        let attn = attention(&params);
        let x = Tensor::randn(0.0f32, 1.0, (1, 4, params.hidden_size), &Device::Cpu).unwrap();
        let causal = create_causal_mask(4, &Device::Cpu).unwrap();
        let am = Tensor::new(&[[1u32, 0, 1, 1]], &Device::Cpu).unwrap();
        let bias = padding_bias(&am).unwrap();
        let (_, weights) = attn
            .forward_with_weights(&x, &causal, Some(&bias), false)
            .unwrap();
        // Queries 2 and 3 looking at padded key 1.
        let column: Vec<f32> = weights
            .narrow(3, 1, 1)
            .unwrap()
            .narrow(2, 2, 2)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(column.iter().all(|&v| v < 1e-3));
    }

    #[test]
    fn test_indivisible_heads_fail_at_construction() {
        let params = ModelParameters {
            hidden_size: 10,
            num_heads: 4,
            ..ModelParameters::tiny()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(CausalSelfAttention::new(&params, vb).is_err());
    }

    #[test]
    fn test_causal_mask_layout() {
        let mask = create_causal_mask(3, &Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 3, 3]);
        let rows: Vec<Vec<f32>> = mask.reshape((3, 3)).unwrap().to_vec2().unwrap();
        assert_eq!(rows[0][0], 0.0);
        assert!(rows[0][1].is_infinite());
        assert_eq!(rows[2][1], 0.0);
    }
}
