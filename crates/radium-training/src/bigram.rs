//! Byte-level bigram language model.
//!
//! The smallest model that still exercises the whole training loop: logits for
//! the next byte are one row of a `[vocab, vocab]` transition matrix plus a
//! bias vector. Loss is next-token cross-entropy with padding targets masked out.

use crate::error::{TrainingError, TrainingResult};
use crate::iterator::PAD_TOKEN;
use crate::model::{LossFn, Model};
use crate::state::ModelConfig;
use crate::tensor::{ParamTree, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const TRANSITIONS: &str = "bigram/transitions";
pub const BIAS: &str = "bigram/bias";

const DEFAULT_VOCAB: usize = 256;
const DEFAULT_INIT_SCALE: f64 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BigramModel {
    vocab_size: usize,
    init_scale: f32,
}

impl BigramModel {
    /// Reads `vocab_size` (default 256, at most 256) and `init_scale` (default 0.02).
    pub fn from_config(config: &ModelConfig) -> TrainingResult<Self> {
        let vocab_size = config.optional_usize("vocab_size")?.unwrap_or(DEFAULT_VOCAB);
        if vocab_size > DEFAULT_VOCAB {
            return Err(TrainingError::Configuration(format!(
                "vocab_size {vocab_size} exceeds byte vocabulary of {DEFAULT_VOCAB}"
            )));
        }
        let init_scale = config.optional_f64("init_scale")?.unwrap_or(DEFAULT_INIT_SCALE);
        if !init_scale.is_finite() || init_scale < 0.0 {
            return Err(TrainingError::Configuration("init_scale must be >= 0".to_string()));
        }
        Ok(Self { vocab_size, init_scale: init_scale as f32 })
    }

    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn token(&self, token: u8) -> TrainingResult<usize> {
        let t = usize::from(token);
        if t >= self.vocab_size {
            return Err(TrainingError::Model(format!(
                "token {t} outside vocabulary of {}",
                self.vocab_size
            )));
        }
        Ok(t)
    }

    fn weights<'p>(&self, params: &'p ParamTree) -> TrainingResult<(&'p [f32], &'p [f32])> {
        let v = self.vocab_size;
        let transitions = params
            .get(TRANSITIONS)
            .filter(|t| t.shape == [v, v])
            .ok_or_else(|| TrainingError::Model(format!("missing or misshapen `{TRANSITIONS}`")))?;
        let bias = params
            .get(BIAS)
            .filter(|t| t.shape == [v])
            .ok_or_else(|| TrainingError::Model(format!("missing or misshapen `{BIAS}`")))?;
        Ok((&transitions.data, &bias.data))
    }

    fn logits_into(&self, (transitions, bias): (&[f32], &[f32]), token: usize, out: &mut [f32]) {
        let v = self.vocab_size;
        let row = &transitions[token * v..(token + 1) * v];
        for ((o, w), b) in out.iter_mut().zip(row).zip(bias) {
            *o = w + b;
        }
    }
}

impl Model for BigramModel {
    fn init(&self, seed: u64, example: &[u8]) -> TrainingResult<ParamTree> {
        for token in example {
            self.token(*token)?;
        }

        let v = self.vocab_size;
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = self.init_scale;
        let data = (0..v * v)
            .map(|_| if scale > 0.0 { rng.gen_range(-scale..scale) } else { 0.0 })
            .collect();

        let mut params = ParamTree::new();
        params.insert(TRANSITIONS, Tensor::new(vec![v, v], data)?);
        params.insert(BIAS, Tensor::zeros(vec![v]));
        Ok(params)
    }

    fn apply(&self, params: &ParamTree, _seed: u64, tokens: &[u8]) -> TrainingResult<Tensor> {
        let weights = self.weights(params)?;
        let v = self.vocab_size;
        let mut data = vec![0.0; tokens.len() * v];
        for (i, token) in tokens.iter().enumerate() {
            let t = self.token(*token)?;
            self.logits_into(weights, t, &mut data[i * v..(i + 1) * v]);
        }
        Tensor::new(vec![tokens.len(), v], data)
    }
}

/// Masked next-token cross-entropy for [`BigramModel`], averaged over every
/// non-padding target in the batch.
#[derive(Debug, Clone, Copy)]
pub struct BigramLoss {
    model: BigramModel,
}

impl BigramLoss {
    #[must_use]
    pub fn new(model: BigramModel) -> Self {
        Self { model }
    }
}

impl LossFn for BigramLoss {
    fn compute(&self, params: &ParamTree, _seed: u64, batch: &[Vec<u8>]) -> TrainingResult<(f32, ParamTree)> {
        let model = &self.model;
        let v = model.vocab_size;
        let weights = model.weights(params)?;

        let mut grad_w = vec![0.0f64; v * v];
        let mut grad_b = vec![0.0f64; v];
        let mut logits = vec![0.0f32; v];
        let mut total = 0.0f64;
        let mut targets = 0usize;

        for sequence in batch {
            for pair in sequence.windows(2) {
                if pair[1] == PAD_TOKEN {
                    continue;
                }
                let (input, target) = (model.token(pair[0])?, model.token(pair[1])?);
                model.logits_into(weights, input, &mut logits);

                let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let exps: Vec<f64> = logits.iter().map(|l| f64::from(l - max).exp()).collect();
                let norm: f64 = exps.iter().sum();
                total += norm.ln() - f64::from(logits[target] - max);

                let row = &mut grad_w[input * v..(input + 1) * v];
                for (j, e) in exps.iter().enumerate() {
                    let p = e / norm - if j == target { 1.0 } else { 0.0 };
                    row[j] += p;
                    grad_b[j] += p;
                }
                targets += 1;
            }
        }

        let denom = targets.max(1) as f64;
        let loss = (total / denom) as f32;
        if !loss.is_finite() {
            return Err(TrainingError::Model(format!("non-finite loss {loss}")));
        }

        let scale = |g: Vec<f64>| g.into_iter().map(|x| (x / denom) as f32).collect::<Vec<f32>>();
        let mut grads = ParamTree::new();
        grads.insert(TRANSITIONS, Tensor::new(vec![v, v], scale(grad_w))?);
        grads.insert(BIAS, Tensor::new(vec![v], scale(grad_b))?);
        Ok((loss, grads))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(vocab: usize) -> BigramModel {
        let config = ModelConfig::from_toml_str(&format!("seq_len = 8\nvocab_size = {vocab}")).unwrap();
        BigramModel::from_config(&config).unwrap()
    }

    #[test]
    fn test_init_is_deterministic_per_seed() {
        let m = model(16);
        let a = m.init(1, &[0; 8]).unwrap();
        let b = m.init(1, &[0; 8]).unwrap();
        let c = m.init(2, &[0; 8]).unwrap();
        assert!(a.bit_eq(&b));
        assert!(!a.bit_eq(&c));
        assert_eq!(a.num_params(), 16 * 16 + 16);
    }

    #[test]
    fn test_apply_shape_and_vocab_check() {
        let m = model(16);
        let params = m.init(0, &[0; 8]).unwrap();
        let logits = m.apply(&params, 0, &[1, 2, 3]).unwrap();
        assert_eq!(logits.shape, vec![3, 16]);
        assert!(m.apply(&params, 0, &[200]).is_err());
    }

    #[test]
    fn test_uniform_logits_give_log_vocab_loss() {
        let m = model(8);
        let params = ParamTree::from_iter([
            (TRANSITIONS.to_string(), Tensor::zeros(vec![8, 8])),
            (BIAS.to_string(), Tensor::zeros(vec![8])),
        ]);
        let (loss, grads) = BigramLoss::new(m).compute(&params, 0, &[vec![1, 2, 3, 0]]).unwrap();
        assert!((f64::from(loss) - 8f64.ln()).abs() < 1e-6);
        // Each masked-in target row sums to zero.
        let row: f32 = grads.get(TRANSITIONS).unwrap().data[8..16].iter().sum();
        assert!(row.abs() < 1e-6);
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let m = model(4);
        let loss_fn = BigramLoss::new(m);
        let params = m.init(5, &[0; 4]).unwrap();
        let batch = vec![vec![1, 2, 3, 1], vec![2, 2, 1, 0]];
        let (_, grads) = loss_fn.compute(&params, 0, &batch).unwrap();

        let eps = 1e-3f32;
        let idx = 4 + 2;
        let mut bumped = params.clone();
        let mut t = bumped.get(TRANSITIONS).unwrap().clone();
        t.data[idx] += eps;
        bumped.insert(TRANSITIONS, t);
        let (plus, _) = loss_fn.compute(&bumped, 0, &batch).unwrap();
        let (base, _) = loss_fn.compute(&params, 0, &batch).unwrap();

        let numeric = (plus - base) / eps;
        let analytic = grads.get(TRANSITIONS).unwrap().data[idx];
        assert!((numeric - analytic).abs() < 1e-2, "numeric {numeric} vs analytic {analytic}");
    }

    #[test]
    fn test_vocab_above_byte_range_is_rejected() {
        let config = ModelConfig::from_toml_str("seq_len = 8\nvocab_size = 300").unwrap();
        assert!(BigramModel::from_config(&config).is_err());
    }
}
