//! Autoregressive decoding with repetition penalty, temperature, top-k and
//! nucleus filtering.
//!
//! Filters operate on host-side logit rows, one per sequence. Each decoding
//! step runs a full forward pass over the (possibly truncated) context and
//! keeps only the final position.

use candle_core::{IndexOp, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::embedding::ids_tensor;
use crate::error::{RapportError, Result};
use crate::model::RapportModel;

/// Temperatures below this decode greedily instead of dividing by ~0.
pub const MIN_TEMPERATURE: f32 = 1e-5;

/// Sampling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Upper bound on generated tokens per sequence
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
    /// Logit divisor; values below [`MIN_TEMPERATURE`] mean greedy decoding
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Nucleus mass; 1.0 disables the filter
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Keep the k best logits; 0 disables the filter
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Penalty applied to ids already in the context; 1.0 is a no-op
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,
    /// Sequence stops once this id is produced
    #[serde(default)]
    pub eos_token_id: Option<u32>,
    /// Filler appended to stopped sequences while others keep going
    #[serde(default)]
    pub pad_token_id: Option<u32>,
    /// Sampler seed
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_max_new_tokens() -> usize {
    256
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.9
}
fn default_top_k() -> usize {
    50
}
fn default_repetition_penalty() -> f32 {
    1.1
}
fn default_seed() -> u64 {
    42
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: default_max_new_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            repetition_penalty: default_repetition_penalty(),
            eos_token_id: None,
            pad_token_id: None,
            seed: default_seed(),
        }
    }
}

impl GenerationConfig {
    /// Deterministic argmax decoding.
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            temperature: 0.0,
            top_p: 1.0,
            top_k: 1,
            repetition_penalty: 1.0,
            ..Default::default()
        }
    }

    /// Check ranges.
    pub fn validate(&self) -> Result<()> {
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(RapportError::config("top_p must be in (0, 1]"));
        }
        if self.temperature < 0.0 || !self.temperature.is_finite() {
            return Err(RapportError::config("temperature must be a finite value >= 0"));
        }
        if self.repetition_penalty <= 0.0 {
            return Err(RapportError::config("repetition_penalty must be positive"));
        }
        Ok(())
    }
}

/// Per-sequence decoding state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    /// Still producing tokens
    Running,
    /// Produced the end token
    Stopped,
}

/// Lower the logit of every id present in `context`.
///
/// Positive logits are divided by `penalty` and non-positive ones multiplied,
/// so for `penalty > 1` every nonzero logit moves down.
pub fn apply_repetition_penalty(logits: &mut [f32], context: &[u32], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    let mut seen = vec![false; logits.len()];
    for &id in context {
        let idx = id as usize;
        if idx < logits.len() && !seen[idx] {
            seen[idx] = true;
            let l = logits[idx];
            logits[idx] = if l > 0.0 { l / penalty } else { l * penalty };
        }
    }
}

/// Divide all logits by `temperature`. Callers decode greedily below [`MIN_TEMPERATURE`].
pub fn apply_temperature(logits: &mut [f32], temperature: f32) {
    let t = temperature.max(MIN_TEMPERATURE);
    for l in logits.iter_mut() {
        *l /= t;
    }
}

/// Keep the `k` highest logits (and any ties with the k-th); the rest become `-inf`.
pub fn top_k_filter(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }
    let mut sorted: Vec<f32> = logits.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let threshold = sorted[k - 1];
    for l in logits.iter_mut() {
        if *l < threshold {
            *l = f32::NEG_INFINITY;
        }
    }
}

/// Nucleus filter.
///
/// Walks ids by descending probability and removes every id that comes after
/// the point where the cumulative probability first exceeds `p`. The most
/// probable id always survives, so the distribution never empties.
pub fn top_p_filter(logits: &mut [f32], p: f32) {
    if p >= 1.0 || logits.is_empty() {
        return;
    }
    let probs = softmax(logits);
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));

    let mut cumulative = 0.0f32;
    let mut exceeded = false;
    for (rank, &idx) in order.iter().enumerate() {
        if rank > 0 && exceeded {
            logits[idx] = f32::NEG_INFINITY;
            continue;
        }
        cumulative += probs[idx];
        if cumulative > p {
            exceeded = true;
        }
    }
}

/// Numerically stable softmax; `-inf` entries get probability 0.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![0.0; logits.len()];
    }
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Index of the largest logit (first one on ties).
pub fn argmax(logits: &[f32]) -> Option<u32> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &l) in logits.iter().enumerate() {
        match best {
            _ if l.is_nan() => {}
            Some((_, b)) if b >= l => {}
            _ => best = Some((i, l)),
        }
    }
    best.map(|(i, _)| i as u32)
}

/// Apply the full filter chain to one logit row and pick a token.
pub fn select_token(
    mut logits: Vec<f32>,
    context: &[u32],
    config: &GenerationConfig,
    rng: &mut ChaCha8Rng,
) -> Result<u32> {
    apply_repetition_penalty(&mut logits, context, config.repetition_penalty);

    let greedy = config.temperature < MIN_TEMPERATURE;
    if !greedy {
        apply_temperature(&mut logits, config.temperature);
    }
    top_k_filter(&mut logits, config.top_k);
    top_p_filter(&mut logits, config.top_p);

    if greedy {
        return argmax(&logits).ok_or_else(|| RapportError::generation("empty logit row"));
    }

    let probs = softmax(&logits);
    let dist = WeightedIndex::new(&probs)
        .map_err(|e| RapportError::generation(format!("cannot sample: {e}")))?;
    Ok(dist.sample(rng) as u32)
}

/// Decoding loop over a model.
pub struct Generator<'a> {
    model: &'a RapportModel,
    config: GenerationConfig,
    rng: ChaCha8Rng,
}

impl<'a> Generator<'a> {
    /// Create a generator; the sampler is seeded from `config.seed`.
    pub fn new(model: &'a RapportModel, config: GenerationConfig) -> Result<Self> {
        config.validate()?;
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Ok(Self { model, config, rng })
    }

    /// Active sampling parameters.
    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Extend each prompt with up to `max_new_tokens` tokens.
    ///
    /// All prompts must have the same non-zero length. Returns prompt plus
    /// generated ids per sequence. A sequence that produced the end token is
    /// padded (with `pad_token_id`, else the end token) while the rest of the
    /// batch continues.
    pub fn generate(&mut self, prompts: &[Vec<u32>]) -> Result<Vec<Vec<u32>>> {
        let len = prompts.first().map(Vec::len).unwrap_or(0);
        if len == 0 || prompts.iter().any(|p| p.len() != len) {
            return Err(RapportError::generation(
                "prompts must be non-empty and of equal length",
            ));
        }

        let max_length = self.model.params().max_length;
        let mut sequences: Vec<Vec<u32>> = prompts.to_vec();
        let mut states = vec![SequenceState::Running; prompts.len()];

        for _ in 0..self.config.max_new_tokens {
            let cur_len = sequences[0].len();
            let start = cur_len.saturating_sub(max_length);
            let window: Vec<Vec<u32>> = sequences.iter().map(|s| s[start..].to_vec()).collect();

            let input = ids_tensor(&window, self.model.device())?;
            let logits = self.model.logits(&input, None, false)?;
            let rows = last_position_rows(&logits)?;

            for (i, row) in rows.into_iter().enumerate() {
                let next = match states[i] {
                    SequenceState::Stopped => self
                        .config
                        .pad_token_id
                        .or(self.config.eos_token_id)
                        .unwrap_or(0),
                    SequenceState::Running => {
                        let token = select_token(row, &sequences[i], &self.config, &mut self.rng)?;
                        if Some(token) == self.config.eos_token_id {
                            states[i] = SequenceState::Stopped;
                        }
                        token
                    }
                };
                sequences[i].push(next);
            }

            if states.iter().all(|s| *s == SequenceState::Stopped) {
                break;
            }
        }

        Ok(sequences)
    }

    /// Decode a single prompt and return only the new tokens, without the end token.
    pub fn complete(&mut self, prompt: &[u32]) -> Result<Vec<u32>> {
        let out = self.generate(&[prompt.to_vec()])?;
        let mut generated: Vec<u32> = out
            .into_iter()
            .next()
            .map(|s| s[prompt.len()..].to_vec())
            .unwrap_or_default();
        if let Some(eos) = self.config.eos_token_id {
            if let Some(pos) = generated.iter().position(|&t| t == eos) {
                generated.truncate(pos);
            }
        }
        Ok(generated)
    }
}

/// Convenience wrapper matching the serving interface.
#[allow(clippy::too_many_arguments)]
pub fn generate(
    model: &RapportModel,
    prompt_tokens: &[Vec<u32>],
    max_new_tokens: usize,
    temperature: f32,
    top_p: f32,
    top_k: usize,
    repetition_penalty: f32,
    eos_id: Option<u32>,
    pad_id: Option<u32>,
) -> Result<Vec<Vec<u32>>> {
    let config = GenerationConfig {
        max_new_tokens,
        temperature,
        top_p,
        top_k,
        repetition_penalty,
        eos_token_id: eos_id,
        pad_token_id: pad_id,
        ..Default::default()
    };
    Generator::new(model, config)?.generate(prompt_tokens)
}

/// Last-position logits of a `(batch, seq, vocab)` tensor as host rows.
pub fn last_position_rows(logits: &Tensor) -> Result<Vec<Vec<f32>>> {
    let (_, seq_len, _) = logits.dims3()?;
    let last = logits.i((.., seq_len - 1, ..))?;
    Ok(last.to_dtype(candle_core::DType::F32)?.to_vec2()?)
}
