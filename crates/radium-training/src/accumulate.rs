use crate::error::{TrainingError, TrainingResult};
use crate::tensor::ParamTree;

/// Gradient of one completed accumulation window.
#[derive(Debug, Clone, PartialEq)]
pub struct AccumulatedGradient {
    /// Element-wise mean of the window's micro-batch gradients.
    pub gradients: ParamTree,
    /// Loss of the last micro-batch in the window.
    pub loss: f32,
}

/// Folds `every` consecutive micro-batch gradients into one mean gradient.
#[derive(Debug, Clone)]
pub struct GradientAccumulator {
    every: u32,
    pending: u32,
    sum: Option<ParamTree>,
}

impl GradientAccumulator {
    pub fn new(every: u32) -> TrainingResult<Self> {
        if every == 0 {
            return Err(TrainingError::Configuration("grad_accum_every must be >= 1".to_string()));
        }
        Ok(Self { every, pending: 0, sum: None })
    }

    #[must_use]
    pub fn every(&self) -> u32 {
        self.every
    }

    /// Micro-batches folded since the last completed window.
    #[must_use]
    pub fn pending(&self) -> u32 {
        self.pending
    }

    /// Adds one micro-batch. Returns the combined gradient on the `every`-th call
    /// and starts a new window.
    pub fn accumulate(&mut self, loss: f32, gradients: ParamTree) -> TrainingResult<Option<AccumulatedGradient>> {
        match self.sum.as_mut() {
            Some(sum) => sum.add_assign(&gradients)?,
            None => self.sum = Some(gradients),
        }
        self.pending += 1;

        if self.pending < self.every {
            return Ok(None);
        }

        let mut gradients = self.sum.take().unwrap_or_default();
        if self.every > 1 {
            gradients.scale(1.0 / self.every as f32);
        }
        self.pending = 0;
        Ok(Some(AccumulatedGradient { gradients, loss }))
    }
}
