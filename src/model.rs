//! The full decoder-only language model.
//!
//! - Token and positional embeddings
//! - `num_layers` pre-norm transformer blocks
//! - Final layer norm and an output projection tied to the token embedding
//! - Shifted cross-entropy that ignores padded label positions

use std::collections::HashMap;
use std::path::Path;

use candle_core::safetensors::Load;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Linear, Module, VarBuilder, VarMap};

use crate::attention::{create_causal_mask, padding_bias};
use crate::config::ModelParameters;
use crate::embedding::EmbeddingStage;
use crate::error::{RapportError, Result};
use crate::layer::TransformerBlock;
use crate::norm::{layer_norm, log_softmax_last_dim, LayerNorm};

/// Output of [`RapportModel::forward`].
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// `(batch, seq_len, vocab_size)` logits
    pub logits: Tensor,
    /// Mean cross-entropy over non-pad targets, when labels were given
    pub loss: Option<Tensor>,
}

/// Autoregressive transformer language model.
///
/// All parameters live in one [`VarMap`]. The output projection reuses the
/// `token_embedding.weight` variable, so gradients from both uses land on
/// the same storage and a checkpoint holds the table once.
pub struct RapportModel {
    embeddings: EmbeddingStage,
    layers: Vec<TransformerBlock>,
    ln_final: LayerNorm,
    lm_head: Linear,
    params: ModelParameters,
    device: Device,
    var_map: VarMap,
    frozen: bool,
}

impl RapportModel {
    /// Create a randomly initialized model.
    ///
    /// Fails if the parameters violate their invariants, e.g. when
    /// `hidden_size` is not divisible by `num_heads`.
    pub fn new(params: &ModelParameters, device: &Device) -> Result<Self> {
        params.validate()?;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);

        let embeddings = EmbeddingStage::new(params, vb.clone())?;
        let layers = (0..params.num_layers)
            .map(|i| TransformerBlock::new(params, vb.pp(format!("layers.{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let ln_final = layer_norm(params.hidden_size, params.layer_norm_eps, vb.pp("ln_final"))?;
        let lm_head = Linear::new(embeddings.token_weight().clone(), None);

        Ok(Self {
            embeddings,
            layers,
            ln_final,
            lm_head,
            params: params.clone(),
            device: device.clone(),
            var_map,
            frozen: false,
        })
    }

    /// Compute logits and, when `labels` are given, the masked LM loss.
    ///
    /// * `input_ids` - `(batch, seq_len)` u32 ids, each below `vocab_size`
    /// * `attention_mask` - optional `(batch, seq_len)` with 1 on real tokens
    /// * `labels` - optional `(batch, seq_len)` targets; `pad_token_id` marks ignored positions
    /// * `train` - enables dropout
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        labels: Option<&Tensor>,
        train: bool,
    ) -> Result<ModelOutput> {
        let logits = self.logits(input_ids, attention_mask, train)?;
        let loss = match labels {
            Some(labels) => Some(masked_lm_loss(&logits, labels, self.params.pad_token_id)?),
            None => None,
        };
        Ok(ModelOutput { logits, loss })
    }

    /// Logits only.
    pub fn logits(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        let train = train && !self.frozen;

        let mut hidden = self.embeddings.forward(input_ids, train)?;
        let causal = create_causal_mask(seq_len, &self.device)?;
        let bias = attention_mask.map(padding_bias).transpose()?;

        for layer in &self.layers {
            hidden = layer.forward(&hidden, &causal, bias.as_ref(), train)?;
        }

        let logits = self.lm_head.forward(&self.ln_final.forward(&hidden)?)?;
        if self.frozen {
            Ok(logits.detach())
        } else {
            Ok(logits)
        }
    }

    /// Architecture of this model.
    pub fn params(&self) -> &ModelParameters {
        &self.params
    }

    /// Device holding the weights.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Parameter store.
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Number of transformer blocks.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Whether this instance is a frozen reference.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Named parameters sorted by name.
    pub fn named_parameters(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .var_map
            .data()
            .lock()
            .map_err(|_| RapportError::training("parameter store lock poisoned"))?;
        let mut vars: Vec<(String, Var)> =
            data.iter().map(|(n, v)| (n.clone(), v.clone())).collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    /// Total number of trainable scalars.
    pub fn parameter_count(&self) -> Result<usize> {
        Ok(self
            .named_parameters()?
            .iter()
            .map(|(_, v)| v.elem_count())
            .sum())
    }

    /// An independent trainable copy with identical weights.
    pub fn duplicate(&self) -> Result<Self> {
        let copy = Self::new(&self.params, &self.device)?;
        copy.copy_weights_from(self)?;
        Ok(copy)
    }

    /// A copy whose weights never change and whose outputs carry no gradient.
    /// Dropout is disabled on the copy.
    pub fn frozen_copy(&self) -> Result<Self> {
        let mut copy = self.duplicate()?;
        copy.frozen = true;
        Ok(copy)
    }

    /// Overwrite every parameter with the same-named parameter of `other`.
    pub fn copy_weights_from(&self, other: &RapportModel) -> Result<()> {
        if self.params != other.params {
            return Err(RapportError::config(
                "cannot copy weights between different architectures",
            ));
        }
        let source: HashMap<String, Var> = other.named_parameters()?.into_iter().collect();
        for (name, var) in self.named_parameters()? {
            let src = source
                .get(&name)
                .ok_or_else(|| RapportError::MissingTensor(name.clone()))?;
            var.set(&src.as_tensor().copy()?)?;
        }
        Ok(())
    }

    /// Write all parameters to a safetensors file.
    pub fn save_weights(&self, path: &Path) -> Result<()> {
        self.var_map.save(path)?;
        Ok(())
    }

    /// Load weights saved by [`Self::save_weights`].
    ///
    /// Strict: every declared parameter must be present with exactly the
    /// declared shape and the file may not carry extra tensors. Nothing is
    /// modified unless the whole file checks out.
    pub fn load_weights(&self, path: &Path) -> Result<()> {
        let params = self.named_parameters()?;
        let expected: HashMap<String, Vec<usize>> = params
            .iter()
            .map(|(n, v)| (n.clone(), v.dims().to_vec()))
            .collect();
        let mut tensors = read_weights_file(path, &expected, &self.device)?;

        for (name, var) in params {
            let tensor = tensors
                .remove(&name)
                .ok_or_else(|| RapportError::MissingTensor(name.clone()))?;
            var.set(&tensor.to_dtype(DType::F32)?)?;
        }
        tracing::debug!("loaded {} tensors from {}", expected.len(), path.display());
        Ok(())
    }
}

/// Read a safetensors file once, check every tensor against the declared
/// shapes, then materialize them on `device`.
fn read_weights_file(
    path: &Path,
    expected: &HashMap<String, Vec<usize>>,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let bytes = std::fs::read(path)?;
    let file = safetensors::SafeTensors::deserialize(&bytes)
        .map_err(|e| RapportError::checkpoint(format!("{}: {e}", path.display())))?;

    let views = file.tensors();
    for (name, view) in &views {
        let want = expected
            .get(name)
            .ok_or_else(|| RapportError::UnexpectedTensor(name.clone()))?;
        if view.shape() != want.as_slice() {
            return Err(RapportError::shape_mismatch(name.clone(), want, view.shape()));
        }
    }
    if views.len() != expected.len() {
        let mut names: Vec<&String> = expected.keys().collect();
        names.sort();
        if let Some(missing) = names
            .into_iter()
            .find(|n| !views.iter().any(|(present, _)| present == *n))
        {
            return Err(RapportError::MissingTensor(missing.clone()));
        }
    }

    let mut tensors = HashMap::with_capacity(views.len());
    for (name, view) in views {
        let tensor = view.load(device)?;
        tensors.insert(name, tensor);
    }
    Ok(tensors)
}

/// Per-position log-probability of the next label, and a 0/1 mask of
/// positions whose label is not padding. Both are `(batch, seq_len - 1)`.
pub fn shifted_token_log_probs(
    logits: &Tensor,
    labels: &Tensor,
    pad_token_id: u32,
) -> Result<(Tensor, Tensor)> {
    let (_, seq_len, _) = logits.dims3()?;
    if seq_len < 2 {
        return Err(RapportError::training(
            "need at least two positions to predict a next token",
        ));
    }
    let logits = logits.narrow(1, 0, seq_len - 1)?;
    let targets = labels.narrow(1, 1, seq_len - 1)?.contiguous()?;

    let log_probs = log_softmax_last_dim(&logits)?;
    let picked = log_probs.gather(&targets.unsqueeze(2)?, 2)?.squeeze(2)?;
    let mask = targets.ne(pad_token_id)?.to_dtype(DType::F32)?;
    Ok((picked, mask))
}

/// Mean next-token cross-entropy over positions whose label is not `pad_token_id`.
pub fn masked_lm_loss(logits: &Tensor, labels: &Tensor, pad_token_id: u32) -> Result<Tensor> {
    let (picked, mask) = shifted_token_log_probs(logits, labels, pad_token_id)?;
    let total = (picked * &mask)?.sum_all()?;
    let count = mask.sum_all()?.to_scalar::<f32>()?.max(1.0);
    Ok((total / count as f64)?.neg()?)
}

/// Length-normalized sequence log-probability, `(batch,)`.
pub fn sequence_log_probs(logits: &Tensor, labels: &Tensor, pad_token_id: u32) -> Result<Tensor> {
    let (picked, mask) = shifted_token_log_probs(logits, labels, pad_token_id)?;
    let summed = (picked * &mask)?.sum(1)?;
    let counts = mask.sum(1)?.maximum(1f32)?;
    Ok(summed.div(&counts)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::ids_tensor;

    fn ids(rows: &[Vec<u32>]) -> Tensor {
        ids_tensor(rows, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_model_forward_shape() {
        let params = ModelParameters::tiny();
        let model = RapportModel::new(&params, &Device::Cpu).unwrap();
        let input = ids(&[vec![5, 6, 7, 8], vec![9, 10, 11, 12]]);
        let out = model.forward(&input, None, None, false).unwrap();
        assert_eq!(out.logits.dims(), &[2, 4, params.vocab_size]);
        assert!(out.loss.is_none());
    }

    #[test]
    fn test_model_loss_is_positive_and_finite() {
        let params = ModelParameters::tiny();
        let model = RapportModel::new(&params, &Device::Cpu).unwrap();
        let input = ids(&[vec![5, 6, 7, 8]]);
        let out = model.forward(&input, None, Some(&input), false).unwrap();
        let loss = out.loss.unwrap().to_scalar::<f32>().unwrap();
        assert!(loss.is_finite());
        // Near-uniform predictions at init.
        assert!((loss - (params.vocab_size as f32).ln()).abs() < 1.0);
    }

    #[test]
    fn test_invalid_architecture_fails_fast() {
        let params = ModelParameters {
            hidden_size: 30,
            num_heads: 4,
            ..ModelParameters::tiny()
        };
        assert!(matches!(
            RapportModel::new(&params, &Device::Cpu),
            Err(RapportError::Config(_))
        ));
    }

    #[test]
    fn test_output_projection_is_tied() {
        let params = ModelParameters::tiny();
        let model = RapportModel::new(&params, &Device::Cpu).unwrap();
        let names: Vec<String> = model
            .named_parameters()
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert!(names.contains(&"token_embedding.weight".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("lm_head")));
        assert_eq!(model.parameter_count().unwrap(), params.parameter_count());
    }

    #[test]
    fn test_tied_weight_receives_both_gradient_contributions() {
        let params = ModelParameters::tiny();
        let model = RapportModel::new(&params, &Device::Cpu).unwrap();
        let input = ids(&[vec![5, 6, 7, 8]]);
        let loss = model.forward(&input, None, Some(&input), true).unwrap().loss.unwrap();
        let grads = loss.backward().unwrap();

        let (_, table) = model
            .named_parameters()
            .unwrap()
            .into_iter()
            .find(|(n, _)| n == "token_embedding.weight")
            .unwrap();
        let grad = grads.get(table.as_tensor()).unwrap();
        // Row 200 is never an input, so only the output projection touches it.
        let unused_row = grad
            .narrow(0, 200, 1)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(unused_row > 0.0);
    }

    #[test]
    fn test_padded_positions_do_not_change_loss() {
        let params = ModelParameters::tiny();
        let model = RapportModel::new(&params, &Device::Cpu).unwrap();
        let pad = params.pad_token_id;

        let labels = ids(&[vec![10, 11, 12, 13, pad, pad]]);
        let mask = ids(&[vec![1, 1, 1, 1, 0, 0]]);
        let input_a = ids(&[vec![10, 11, 12, 13, pad, pad]]);
        let input_b = ids(&[vec![10, 11, 12, 13, 99, 140]]);

        let a = model.forward(&input_a, Some(&mask), Some(&labels), false).unwrap();
        let b = model.forward(&input_b, Some(&mask), Some(&labels), false).unwrap();
        let la = a.loss.unwrap().to_scalar::<f32>().unwrap();
        let lb = b.loss.unwrap().to_scalar::<f32>().unwrap();
        assert!((la - lb).abs() < 1e-6, "{la} vs {lb}");
    }

    #[test]
    fn test_masked_loss_ignores_logits_before_pad_labels() {
        let device = Device::Cpu;
        let vocab = 6;
        let logits = Tensor::randn(0.0f32, 1.0, (1, 4, vocab), &device).unwrap();
        let labels = ids(&[vec![2, 3, 0, 0]]);

        // Position 2 predicts label[3] = pad, so its logits are irrelevant.
        let noise = Tensor::randn(0.0f32, 5.0, (1, 1, vocab), &device).unwrap();
        let altered = Tensor::cat(
            &[
                &logits.narrow(1, 0, 2).unwrap(),
                &noise,
                &logits.narrow(1, 3, 1).unwrap(),
            ],
            1,
        )
        .unwrap();

        let a = masked_lm_loss(&logits, &labels, 0).unwrap().to_scalar::<f32>().unwrap();
        let b = masked_lm_loss(&altered, &labels, 0).unwrap().to_scalar::<f32>().unwrap();
        assert!((a - b).abs() < 1e-6);
    }

    #[test]
    fn test_masked_loss_matches_manual_cross_entropy() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[[0.0f32, 1.0, 2.0], [2.0, 0.0, 0.0]]], &device).unwrap();
        let labels = ids(&[vec![0, 2]]);
        // Target 2 from logits [0,1,2].
        let lse = (0f32.exp() + 1f32.exp() + 2f32.exp()).ln();
        let expected = lse - 2.0;
        let loss = masked_lm_loss(&logits, &labels, 1).unwrap().to_scalar::<f32>().unwrap();
        assert!((loss - expected).abs() < 1e-5);
    }

    #[test]
    fn test_sequence_log_probs_length_normalized() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 4, 4), DType::F32, &device).unwrap();
        let labels = ids(&[vec![1, 2, 3, 0], vec![1, 2, 0, 0]]);
        let lp: Vec<f32> = sequence_log_probs(&logits, &labels, 0).unwrap().to_vec1().unwrap();
        // Uniform logits give log(1/4) per token regardless of length.
        for v in lp {
            assert!((v + 4f32.ln()).abs() < 1e-5);
        }
    }

    #[test]
    fn test_frozen_copy_matches_and_detaches() {
        let params = ModelParameters::tiny();
        let model = RapportModel::new(&params, &Device::Cpu).unwrap();
        let frozen = model.frozen_copy().unwrap();
        assert!(frozen.is_frozen());

        let input = ids(&[vec![5, 6, 7]]);
        let a = model.logits(&input, None, false).unwrap();
        let b = frozen.logits(&input, None, true).unwrap();
        let diff = (a - &b).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(diff < 1e-6);

        let grads = b.sum_all().unwrap().backward().unwrap();
        for (_, var) in frozen.named_parameters().unwrap() {
            assert!(grads.get(var.as_tensor()).is_none());
        }
    }

    #[test]
    fn test_weights_roundtrip_and_strict_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let params = ModelParameters::tiny();
        let model = RapportModel::new(&params, &Device::Cpu).unwrap();
        model.save_weights(&path).unwrap();

        let other = RapportModel::new(&params, &Device::Cpu).unwrap();
        other.load_weights(&path).unwrap();
        let input = ids(&[vec![5, 6, 7]]);
        let a = model.logits(&input, None, false).unwrap();
        let b = other.logits(&input, None, false).unwrap();
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(diff, 0.0);

        let wider = ModelParameters {
            hidden_size: 64,
            ..params.clone()
        };
        let mismatched = RapportModel::new(&wider, &Device::Cpu).unwrap();
        assert!(matches!(
            mismatched.load_weights(&path),
            Err(RapportError::ShapeMismatch { .. })
        ));

        let deeper = ModelParameters {
            num_layers: 3,
            ..params
        };
        let deeper = RapportModel::new(&deeper, &Device::Cpu).unwrap();
        assert!(matches!(
            deeper.load_weights(&path),
            Err(RapportError::MissingTensor(_))
        ));
    }

    #[test]
    fn test_rejected_weights_leave_model_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let params = ModelParameters::tiny();
        let shallow = ModelParameters {
            num_layers: 1,
            ..params.clone()
        };
        let shallow_path = dir.path().join("shallow.safetensors");
        RapportModel::new(&shallow, &Device::Cpu)
            .unwrap()
            .save_weights(&shallow_path)
            .unwrap();
        let truncated_path = dir.path().join("truncated.safetensors");
        let bytes = std::fs::read(&shallow_path).unwrap();
        std::fs::write(&truncated_path, &bytes[..bytes.len() / 2]).unwrap();

        let model = RapportModel::new(&params, &Device::Cpu).unwrap();
        let input = ids(&[vec![9, 4, 2]]);
        let before = model.logits(&input, None, false).unwrap();

        assert!(matches!(
            model.load_weights(&shallow_path),
            Err(RapportError::MissingTensor(_))
        ));
        assert!(model.load_weights(&truncated_path).is_err());

        let after = model.logits(&input, None, false).unwrap();
        let diff = (before - after).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(diff, 0.0);
    }
}
