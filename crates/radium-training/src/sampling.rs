use crate::error::{TrainingError, TrainingResult};
use crate::iterator::PAD_TOKEN;
use crate::model::{Model, Sampler};
use crate::tensor::ParamTree;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Renders byte tokens as text, dropping padding.
#[must_use]
pub fn decode_tokens(tokens: &[u8]) -> String {
    let bytes: Vec<u8> = tokens.iter().copied().filter(|t| *t != PAD_TOKEN).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Autoregressive sampling restricted to the `top_k` most likely next tokens.
#[derive(Debug, Clone, Copy)]
pub struct TopKSampler {
    temperature: f32,
}

impl Default for TopKSampler {
    fn default() -> Self {
        Self { temperature: 1.0 }
    }
}

impl TopKSampler {
    pub fn with_temperature(temperature: f32) -> TrainingResult<Self> {
        if !temperature.is_finite() || temperature <= 0.0 {
            return Err(TrainingError::Configuration("temperature must be > 0".to_string()));
        }
        Ok(Self { temperature })
    }

    fn pick(&self, rng: &mut StdRng, logits: &[f32], top_k: usize) -> TrainingResult<u8> {
        let mut ranked: Vec<usize> = (0..logits.len()).collect();
        ranked.sort_by(|a, b| logits[*b].total_cmp(&logits[*a]));
        ranked.truncate(top_k.max(1));

        let max = logits[ranked[0]];
        let weights: Vec<f64> = ranked
            .iter()
            .map(|i| f64::from((logits[*i] - max) / self.temperature).exp())
            .collect();
        let dist = WeightedIndex::new(&weights)
            .map_err(|e| TrainingError::Model(format!("cannot sample from logits: {e}")))?;

        u8::try_from(ranked[dist.sample(rng)])
            .map_err(|_| TrainingError::Model("sampled token outside byte range".to_string()))
    }
}

impl Sampler for TopKSampler {
    fn sample(
        &self,
        seed: u64,
        model: &dyn Model,
        params: &ParamTree,
        prime: &[u8],
        target_len: usize,
        top_k: usize,
    ) -> TrainingResult<Vec<u8>> {
        if prime.is_empty() {
            return Err(TrainingError::Model("sampling needs a non-empty prime".to_string()));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut tokens = prime.to_vec();
        while tokens.len() < target_len {
            let logits = model.apply(params, rng.r#gen(), &tokens)?;
            let vocab = logits.shape.last().copied().unwrap_or(0);
            if vocab == 0 {
                return Err(TrainingError::Model("model produced empty logits".to_string()));
            }
            let last = logits.data.get((tokens.len() - 1) * vocab..tokens.len() * vocab).ok_or_else(|| {
                TrainingError::Model(format!(
                    "model returned {} logits, expected {} rows of {vocab}",
                    logits.data.len(),
                    tokens.len()
                ))
            })?;
            tokens.push(self.pick(&mut rng, last, top_k)?);
        }
        Ok(tokens)
    }

    fn decode(&self, tokens: &[u8]) -> String {
        decode_tokens(tokens)
    }
}
