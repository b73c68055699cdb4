//! Step-interval cadence for checkpointing, validation and sampling.

use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodicTask {
    Checkpoint,
    Validate,
    Sample,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub checkpoint_every: u64,
    pub checkpoint_keep_n: usize,
    pub validate_every: u64,
    pub sample_every: u64,
    /// Tokens of a held-out sequence fed to the sampler before generation.
    pub prime_length: usize,
    pub sample_top_k: usize,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            checkpoint_every: 1000,
            checkpoint_keep_n: 500,
            validate_every: 100,
            sample_every: 500,
            prime_length: 25,
            sample_top_k: 25,
        }
    }
}

impl Schedule {
    pub fn validate(&self) -> TrainingResult<()> {
        for (name, value) in [
            ("checkpoint_every", self.checkpoint_every),
            ("validate_every", self.validate_every),
            ("sample_every", self.sample_every),
        ] {
            if value == 0 {
                return Err(TrainingError::Configuration(format!("{name} must be >= 1")));
            }
        }
        if self.checkpoint_keep_n == 0 {
            return Err(TrainingError::Configuration("checkpoint_keep_n must be >= 1".to_string()));
        }
        if self.prime_length == 0 {
            return Err(TrainingError::Configuration("prime_length must be >= 1".to_string()));
        }
        if self.sample_top_k == 0 {
            return Err(TrainingError::Configuration("sample_top_k must be >= 1".to_string()));
        }
        Ok(())
    }

    /// Tasks due after the step with global index `step` (0-based), in run order.
    #[must_use]
    pub fn due(&self, step: u64) -> Vec<PeriodicTask> {
        let mut tasks = Vec::new();
        if step % self.checkpoint_every == 0 {
            tasks.push(PeriodicTask::Checkpoint);
        }
        if step % self.validate_every == 0 {
            tasks.push(PeriodicTask::Validate);
        }
        if step % self.sample_every == 0 {
            tasks.push(PeriodicTask::Sample);
        }
        tasks
    }
}
