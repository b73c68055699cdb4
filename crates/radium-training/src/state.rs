//! The persisted unit of resumption and how a run picks its starting point.

use crate::checkpoint::CheckpointStore;
use crate::config::load_model_config;
use crate::error::{TrainingError, TrainingResult};
use crate::model::{Model, Optimizer};
use crate::tensor::ParamTree;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

/// Hyperparameters the model collaborator is built from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelConfig(BTreeMap<String, serde_json::Value>);

impl ModelConfig {
    pub fn from_toml_str(text: &str) -> TrainingResult<Self> {
        let values: BTreeMap<String, serde_json::Value> = toml::from_str(text)
            .map_err(|e| TrainingError::Configuration(format!("invalid model config: {e}")))?;
        Ok(Self(values))
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Reads a required positive integer.
    pub fn require_usize(&self, key: &str) -> TrainingResult<usize> {
        self.optional_usize(key)?
            .ok_or_else(|| TrainingError::Configuration(format!("model config is missing `{key}`")))
    }

    pub fn optional_usize(&self, key: &str) -> TrainingResult<Option<usize>> {
        let Some(value) = self.0.get(key) else {
            return Ok(None);
        };
        value
            .as_u64()
            .filter(|v| *v > 0)
            .and_then(|v| usize::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| {
                TrainingError::Configuration(format!("model config `{key}` must be a positive integer, got {value}"))
            })
    }

    pub fn optional_f64(&self, key: &str) -> TrainingResult<Option<f64>> {
        let Some(value) = self.0.get(key) else {
            return Ok(None);
        };
        value
            .as_f64()
            .map(Some)
            .ok_or_else(|| TrainingError::Configuration(format!("model config `{key}` must be a number, got {value}")))
    }

    pub fn seq_len(&self) -> TrainingResult<usize> {
        self.require_usize("seq_len")
    }
}

/// Identifier correlating a training run with its experiment-tracking session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Everything needed to continue training exactly where it stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState<S> {
    pub model_config: ModelConfig,
    pub params: ParamTree,
    pub optimizer_state: S,
    /// Global offset into the training stream of the next unconsumed sequence.
    pub next_seq_index: u64,
    /// Completed optimizer steps over the whole run.
    #[serde(default)]
    pub step: u64,
    pub run_id: Option<RunId>,
}

/// Where a run starts: from the newest checkpoint, or from a model config file.
#[derive(Debug)]
pub enum Bootstrap<S> {
    Resumed(TrainingState<S>),
    Fresh { model_config: ModelConfig },
}

impl<S: DeserializeOwned> Bootstrap<S> {
    /// Loads the newest checkpoint, falling back to `<config_dir>/<model_name>.toml`.
    ///
    /// The config file is only consulted when no checkpoint exists; a resumed run
    /// keeps the configuration it was started with.
    pub fn resolve(store: &CheckpointStore, config_dir: &Path, model_name: &str) -> TrainingResult<Self> {
        if let Some(state) = store.get_last::<S>()? {
            info!(
                next_seq_index = state.next_seq_index,
                step = state.step,
                "resuming from checkpoint"
            );
            return Ok(Self::Resumed(state));
        }

        let model_config = load_model_config(config_dir, model_name)?;
        Ok(Self::Fresh { model_config })
    }
}

impl<S> Bootstrap<S> {
    #[must_use]
    pub fn model_config(&self) -> &ModelConfig {
        match self {
            Self::Resumed(state) => &state.model_config,
            Self::Fresh { model_config } => model_config,
        }
    }

    #[must_use]
    pub fn is_resumed(&self) -> bool {
        matches!(self, Self::Resumed(_))
    }

    /// Overrides `seq_len` for a fresh run. A resumed run keeps its recorded value.
    #[must_use]
    pub fn with_seq_len(mut self, seq_len: Option<usize>) -> Self {
        if let (Self::Fresh { model_config }, Some(seq_len)) = (&mut self, seq_len) {
            model_config.set("seq_len", seq_len);
        }
        self
    }

    /// Materializes the starting state, initializing params and optimizer state
    /// for a fresh run from an all-zero example of `seq_len` tokens.
    pub fn into_state<O>(self, model: &dyn Model, optimizer: &O, seed: u64) -> TrainingResult<TrainingState<S>>
    where
        O: Optimizer<State = S>,
    {
        match self {
            Self::Resumed(state) => Ok(state),
            Self::Fresh { model_config } => {
                let example = vec![0u8; model_config.seq_len()?];
                let params = model.init(seed, &example)?;
                let optimizer_state = optimizer.init(&params);
                Ok(TrainingState {
                    model_config,
                    params,
                    optimizer_state,
                    next_seq_index: 0,
                    step: 0,
                    run_id: None,
                })
            }
        }
    }
}
