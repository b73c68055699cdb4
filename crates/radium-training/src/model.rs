//! Interfaces of the numeric collaborators driven by the orchestrator.
//!
//! The orchestrator never looks inside parameters, gradients or optimizer
//! state; it only threads values returned by these traits from one step to
//! the next.

use crate::error::TrainingResult;
use crate::tensor::{ParamTree, Tensor};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A batch of token sequences, each exactly `seq_len` long.
pub type Batch = Vec<Vec<u8>>;

pub trait Model {
    /// Fresh parameters, shaped by running over `example` once.
    fn init(&self, seed: u64, example: &[u8]) -> TrainingResult<ParamTree>;

    /// Next-token logits for every position, shape `[tokens.len(), vocab]`.
    fn apply(&self, params: &ParamTree, seed: u64, tokens: &[u8]) -> TrainingResult<Tensor>;
}

pub trait LossFn {
    /// Mean loss over `batch` and its gradient with respect to `params`.
    fn compute(&self, params: &ParamTree, seed: u64, batch: &[Vec<u8>]) -> TrainingResult<(f32, ParamTree)>;
}

pub trait Optimizer {
    type State: Clone + Serialize + DeserializeOwned;

    fn init(&self, params: &ParamTree) -> Self::State;

    /// Turns gradients into parameter updates, returning the next optimizer state.
    fn update(
        &self,
        gradients: &ParamTree,
        state: &Self::State,
        params: &ParamTree,
    ) -> TrainingResult<(ParamTree, Self::State)>;

    fn apply(&self, params: &ParamTree, updates: &ParamTree) -> TrainingResult<ParamTree> {
        params.zip_map(updates, |_, p, u| p + u)
    }
}

pub trait Sampler {
    /// Extends `prime` to `target_len` tokens. The result includes the prime.
    fn sample(
        &self,
        seed: u64,
        model: &dyn Model,
        params: &ParamTree,
        prime: &[u8],
        target_len: usize,
        top_k: usize,
    ) -> TrainingResult<Vec<u8>>;

    fn decode(&self, tokens: &[u8]) -> String;
}
