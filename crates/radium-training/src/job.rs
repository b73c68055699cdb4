use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingHyperParams {
    pub seed: u64,
    pub epochs: u32,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub max_grad_norm: f64,
    /// Sequences per micro-batch.
    pub batch_size: u32,
    /// Micro-batches folded into one optimizer update.
    pub grad_accum_every: u32,
    /// Stop after this many optimizer steps in one invocation.
    #[serde(default)]
    pub max_steps: Option<u64>,
}

impl Default for TrainingHyperParams {
    fn default() -> Self {
        Self {
            seed: 42,
            epochs: 100,
            learning_rate: 2e-4,
            weight_decay: 1e-3,
            max_grad_norm: 0.5,
            batch_size: 4,
            grad_accum_every: 4,
            max_steps: None,
        }
    }
}

impl TrainingHyperParams {
    /// Sequences consumed by one optimizer step.
    #[must_use]
    pub fn effective_batch_size(&self) -> u64 {
        u64::from(self.batch_size) * u64::from(self.grad_accum_every)
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.epochs == 0 {
            return Err(TrainingError::Configuration("epochs must be >= 1".to_string()));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(TrainingError::Configuration("learning_rate must be > 0".to_string()));
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(TrainingError::Configuration("weight_decay must be >= 0".to_string()));
        }
        if !self.max_grad_norm.is_finite() || self.max_grad_norm <= 0.0 {
            return Err(TrainingError::Configuration("max_grad_norm must be > 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(TrainingError::Configuration("batch_size must be >= 1".to_string()));
        }
        if self.grad_accum_every == 0 {
            return Err(TrainingError::Configuration("grad_accum_every must be >= 1".to_string()));
        }
        if self.max_steps == Some(0) {
            return Err(TrainingError::Configuration("max_steps must be >= 1 when set".to_string()));
        }
        Ok(())
    }
}
