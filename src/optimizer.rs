//! AdamW, gradient accumulation and dynamic loss scaling.
//!
//! Gradients from each micro-batch's backward pass are summed per parameter
//! name in a [`GradAccumulator`]. At an accumulation boundary the trainer
//! unscales them through the [`LossScaler`], clips the global norm and hands
//! them to [`AdamW::step`].

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};

use crate::error::{RapportError, Result};

/// Optimizer hyperparameters.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Decoupled weight decay
    pub weight_decay: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 2e-5,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 0.01,
            eps: 1e-8,
        }
    }
}

/// AdamW with decoupled weight decay; moments are keyed by parameter name.
#[derive(Debug)]
pub struct AdamW {
    config: OptimizerConfig,
    /// First moment estimates
    m: HashMap<String, Tensor>,
    /// Second moment estimates
    v: HashMap<String, Tensor>,
    /// Step counter for bias correction
    t: usize,
}

impl AdamW {
    /// Create an optimizer with default betas and epsilon.
    pub fn new(learning_rate: f64, weight_decay: f64) -> Self {
        Self::from_config(OptimizerConfig {
            learning_rate,
            weight_decay,
            ..OptimizerConfig::default()
        })
    }

    /// Create an optimizer from explicit hyperparameters.
    pub fn from_config(config: OptimizerConfig) -> Self {
        Self {
            config,
            m: HashMap::new(),
            v: HashMap::new(),
            t: 0,
        }
    }

    /// Get current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    /// Set learning rate (used by schedulers).
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    /// Updates applied so far.
    pub fn step_count(&self) -> usize {
        self.t
    }

    /// Apply one update to every parameter that has a gradient.
    pub fn step(&mut self, params: &[(String, Var)], grads: &HashMap<String, Tensor>) -> Result<()> {
        self.t += 1;
        let OptimizerConfig {
            learning_rate: lr,
            beta1,
            beta2,
            weight_decay,
            eps,
        } = self.config;

        let bc1 = 1.0 - beta1.powi(self.t as i32);
        let bc2 = 1.0 - beta2.powi(self.t as i32);

        for (name, var) in params {
            let Some(grad) = grads.get(name) else {
                continue;
            };
            let m = match self.m.get(name) {
                Some(m) => m.clone(),
                None => Tensor::zeros(var.dims(), DType::F32, var.device())?,
            };
            let v = match self.v.get(name) {
                Some(v) => v.clone(),
                None => Tensor::zeros(var.dims(), DType::F32, var.device())?,
            };

            // m = b1 * m + (1 - b1) * g
            let m_new = ((m * beta1)? + (grad * (1.0 - beta1))?)?;
            // v = b2 * v + (1 - b2) * g^2
            let v_new = ((v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

            let m_hat = (&m_new / bc1)?;
            let v_hat = (&v_new / bc2)?;
            let update = ((m_hat / (v_hat.sqrt()? + eps)?)? * lr)?;

            let w = var.as_tensor();
            let decay = (w * (lr * weight_decay))?;
            var.set(&((w - update)? - decay)?)?;

            self.m.insert(name.clone(), m_new);
            self.v.insert(name.clone(), v_new);
        }
        Ok(())
    }
}

/// Per-parameter gradient sums across micro-batches.
#[derive(Debug, Default)]
pub struct GradAccumulator {
    grads: HashMap<String, Tensor>,
    micro_steps: usize,
}

impl GradAccumulator {
    /// Empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the gradients of one backward pass.
    pub fn accumulate(&mut self, params: &[(String, Var)], store: &GradStore) -> Result<()> {
        for (name, var) in params {
            if let Some(grad) = store.get(var.as_tensor()) {
                let sum = match self.grads.remove(name) {
                    Some(acc) => (acc + grad)?,
                    None => grad.clone(),
                };
                self.grads.insert(name.clone(), sum);
            }
        }
        self.micro_steps += 1;
        Ok(())
    }

    /// Micro-batches added since the last reset.
    pub fn micro_steps(&self) -> usize {
        self.micro_steps
    }

    /// Whether nothing has been accumulated.
    pub fn is_empty(&self) -> bool {
        self.micro_steps == 0
    }

    /// Accumulated gradients by parameter name.
    pub fn grads(&self) -> &HashMap<String, Tensor> {
        &self.grads
    }

    /// Global L2 norm over all accumulated gradients.
    pub fn global_norm(&self) -> Result<f64> {
        let mut total = 0f64;
        for grad in self.grads.values() {
            total += grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
        Ok(total.sqrt())
    }

    /// Multiply every gradient by `factor`.
    pub fn scale(&mut self, factor: f64) -> Result<()> {
        for grad in self.grads.values_mut() {
            *grad = (&*grad * factor)?;
        }
        Ok(())
    }

    /// Clip to `max_norm` and return the norm measured before clipping.
    pub fn clip(&mut self, max_norm: f64) -> Result<f64> {
        let norm = self.global_norm()?;
        if !norm.is_finite() {
            return Err(RapportError::training(format!("gradient norm is {norm}")));
        }
        if max_norm > 0.0 && norm > max_norm {
            self.scale(max_norm / (norm + 1e-6))?;
        }
        Ok(norm)
    }

    /// Drop accumulated gradients.
    pub fn clear(&mut self) {
        self.grads.clear();
        self.micro_steps = 0;
    }
}

/// Dynamic loss scaling for mixed-precision training.
///
/// The loss is multiplied by `scale` before backward and the gradients are
/// divided by it before the update. A non-finite gradient skips the update
/// and halves the scale; `growth_interval` clean steps double it.
#[derive(Debug, Clone)]
pub struct LossScaler {
    enabled: bool,
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    clean_steps: usize,
    skipped: usize,
}

impl LossScaler {
    /// Initial scale for an enabled scaler.
    pub const INIT_SCALE: f64 = 65536.0;
    /// Clean steps before the scale grows.
    pub const GROWTH_INTERVAL: usize = 2000;

    /// Create a scaler; a disabled scaler is the identity.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale: if enabled { Self::INIT_SCALE } else { 1.0 },
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: Self::GROWTH_INTERVAL,
            clean_steps: 0,
            skipped: 0,
        }
    }

    /// Override the initial scale and growth interval.
    pub fn with_scale(mut self, scale: f64, growth_interval: usize) -> Self {
        if self.enabled {
            self.scale = scale;
            self.growth_interval = growth_interval.max(1);
        }
        self
    }

    /// Whether scaling is active.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current scale.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Updates skipped because of non-finite gradients.
    pub fn skipped_steps(&self) -> usize {
        self.skipped
    }

    /// Loss to backpropagate.
    pub fn scale_loss(&self, loss: &Tensor) -> Result<Tensor> {
        if self.enabled {
            Ok((loss * self.scale)?)
        } else {
            Ok(loss.clone())
        }
    }

    /// Undo the scaling on the accumulated gradients.
    ///
    /// Returns `false` when any gradient is non-finite; the caller must
    /// skip the update and call [`Self::update`] with `false`.
    pub fn unscale(&self, grads: &mut GradAccumulator) -> Result<bool> {
        if self.enabled {
            grads.scale(1.0 / self.scale)?;
        }
        Ok(grads.global_norm()?.is_finite())
    }

    /// Record the outcome of a step and adjust the scale.
    ///
    /// A non-finite step is counted as skipped whether or not scaling is on;
    /// only an enabled scaler backs off or grows.
    pub fn update(&mut self, finite: bool) {
        if !finite {
            self.skipped += 1;
            self.clean_steps = 0;
            if self.enabled {
                self.scale *= self.backoff_factor;
            }
            tracing::warn!("non-finite gradients, skipping step; loss scale now {}", self.scale);
            return;
        }
        if !self.enabled {
            return;
        }
        self.clean_steps += 1;
        if self.clean_steps >= self.growth_interval {
            self.scale *= self.growth_factor;
            self.clean_steps = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelParameters;
    use crate::embedding::ids_tensor;
    use crate::model::RapportModel;
    use candle_core::Device;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    fn sequences() -> Vec<Vec<u32>> {
        (0..8u32)
            .map(|row| (0..6u32).map(|col| 3 + (row * 7 + col * 13) % 250).collect())
            .collect()
    }

    #[test]
    fn test_adamw_first_step_moves_by_lr() {
        let var = Var::new(&[1.0f32, -2.0, 3.0], &Device::Cpu).unwrap();
        let params = vec![("w".to_string(), var.clone())];
        let grads = HashMap::from([(
            "w".to_string(),
            Tensor::new(&[0.5f32, -0.5, 2.0], &Device::Cpu).unwrap(),
        )]);

        let mut opt = AdamW::new(0.1, 0.0);
        opt.step(&params, &grads).unwrap();

        // After bias correction the first update is lr * sign(g).
        let got = var.as_tensor().to_vec1::<f32>().unwrap();
        for (g, want) in got.iter().zip([0.9f32, -1.9, 2.9]) {
            assert!((g - want).abs() < 1e-4, "{g} vs {want}");
        }
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn test_adamw_weight_decay_without_gradient_signal() {
        let var = Var::new(&[10.0f32], &Device::Cpu).unwrap();
        let params = vec![("w".to_string(), var.clone())];
        let grads = HashMap::from([("w".to_string(), Tensor::new(&[0.0f32], &Device::Cpu).unwrap())]);

        let mut opt = AdamW::new(0.1, 0.5);
        opt.step(&params, &grads).unwrap();
        let got = var.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((got - 9.5).abs() < 1e-5);
    }

    #[test]
    fn test_adamw_skips_params_without_grads() {
        let var = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let params = vec![("w".to_string(), var.clone())];
        let mut opt = AdamW::new(0.1, 0.5);
        opt.step(&params, &HashMap::new()).unwrap();
        assert_eq!(var.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0]);
    }

    #[test]
    fn test_clip_scales_to_max_norm() {
        let mut acc = GradAccumulator::new();
        acc.grads.insert("a".into(), Tensor::new(&[3.0f32], &Device::Cpu).unwrap());
        acc.grads.insert("b".into(), Tensor::new(&[4.0f32], &Device::Cpu).unwrap());

        let before = acc.clip(1.0).unwrap();
        assert!((before - 5.0).abs() < 1e-6);
        assert!((acc.global_norm().unwrap() - 1.0).abs() < 1e-4);

        let unchanged = acc.clip(10.0).unwrap();
        assert!((unchanged - acc.global_norm().unwrap()).abs() < 1e-9);
    }

    #[test]
    fn test_loss_scaler_backoff_and_growth() {
        let mut scaler = LossScaler::new(true).with_scale(8.0, 2);
        scaler.update(false);
        assert_eq!(scaler.scale(), 4.0);
        assert_eq!(scaler.skipped_steps(), 1);
        scaler.update(true);
        assert_eq!(scaler.scale(), 4.0);
        scaler.update(true);
        assert_eq!(scaler.scale(), 8.0);
    }

    #[test]
    fn test_loss_scaler_roundtrip_and_overflow() {
        let scaler = LossScaler::new(true).with_scale(1024.0, 10);
        let loss = Tensor::new(2.0f32, &Device::Cpu).unwrap();
        let scaled = scaler.scale_loss(&loss).unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(scaled, 2048.0);

        let mut acc = GradAccumulator::new();
        acc.grads.insert("a".into(), Tensor::new(&[2048.0f32], &Device::Cpu).unwrap());
        assert!(scaler.unscale(&mut acc).unwrap());
        let g = acc.grads()["a"].to_vec1::<f32>().unwrap()[0];
        assert!((g - 2.0).abs() < 1e-6);

        acc.grads.insert("b".into(), Tensor::new(&[f32::INFINITY], &Device::Cpu).unwrap());
        assert!(!scaler.unscale(&mut acc).unwrap());
    }

    #[test]
    fn test_disabled_scaler_is_identity() {
        let mut scaler = LossScaler::new(false);
        scaler.update(true);
        scaler.update(false);
        assert_eq!(scaler.scale(), 1.0);
        assert!(!scaler.is_enabled());
    }

    #[test]
    fn test_disabled_scaler_still_counts_skips() {
        let mut scaler = LossScaler::new(false);
        scaler.update(false);
        scaler.update(true);
        scaler.update(false);
        assert_eq!(scaler.skipped_steps(), 2);
        assert_eq!(scaler.scale(), 1.0);
    }

    #[test]
    fn test_accumulation_matches_full_batch() {
        let params = ModelParameters::tiny();
        let full_model = RapportModel::new(&params, &Device::Cpu).unwrap();
        let accum_model = full_model.duplicate().unwrap();
        let rows = sequences();

        // One batch of 8.
        let ids = ids_tensor(&rows, &Device::Cpu).unwrap();
        let loss = full_model.forward(&ids, None, Some(&ids), false).unwrap().loss.unwrap();
        let full_params = full_model.named_parameters().unwrap();
        let mut full = GradAccumulator::new();
        full.accumulate(&full_params, &loss.backward().unwrap()).unwrap();

        // Four micro-batches of 2, each loss divided by 4.
        let accum_params = accum_model.named_parameters().unwrap();
        let mut accum = GradAccumulator::new();
        for chunk in rows.chunks(2) {
            let ids = ids_tensor(chunk, &Device::Cpu).unwrap();
            let loss = accum_model.forward(&ids, None, Some(&ids), false).unwrap().loss.unwrap();
            let loss = (loss / 4.0).unwrap();
            accum.accumulate(&accum_params, &loss.backward().unwrap()).unwrap();
        }
        assert_eq!(accum.micro_steps(), 4);

        for (name, grad) in full.grads() {
            let diff = max_abs_diff(grad, &accum.grads()[name]);
            assert!(diff < 1e-5, "{name} gradient differs by {diff}");
        }

        let config = OptimizerConfig {
            learning_rate: 1e-2,
            weight_decay: 0.0,
            eps: 1.0,
            ..OptimizerConfig::default()
        };
        AdamW::from_config(config.clone()).step(&full_params, full.grads()).unwrap();
        AdamW::from_config(config).step(&accum_params, accum.grads()).unwrap();

        for ((name, a), (_, b)) in full_params.iter().zip(accum_params.iter()) {
            let diff = max_abs_diff(a.as_tensor(), b.as_tensor());
            assert!(diff < 1e-6, "{name} parameter differs by {diff}");
        }
    }

    #[test]
    fn test_tied_embedding_receives_both_gradients() {
        let params = ModelParameters::tiny();
        let model = RapportModel::new(&params, &Device::Cpu).unwrap();
        let named = model.named_parameters().unwrap();
        let ids = ids_tensor(&[vec![5, 6, 7, 8]], &Device::Cpu).unwrap();
        let loss = model.forward(&ids, None, Some(&ids), false).unwrap().loss.unwrap();

        let mut acc = GradAccumulator::new();
        acc.accumulate(&named, &loss.backward().unwrap()).unwrap();
        assert!(acc.grads().contains_key("token_embedding.weight"));
        assert!(!acc.grads().keys().any(|k| k.starts_with("lm_head")));
    }
}
