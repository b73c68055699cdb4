//! Radium Training
//!
//! Resumable training loop primitives:
//! - Persisting and rotating training snapshots (`CheckpointStore`)
//! - Re-skippable batched iteration over sequence data (`ResumableSequenceIterator`)
//! - Gradient accumulation over micro-batches (`GradientAccumulator`)
//! - The step/epoch loop with periodic checkpoint, validation and sampling
//!   tasks (`TrainingOrchestrator`)
//!
//! Numeric work is delegated to the `Model`, `LossFn`, `Optimizer` and
//! `Sampler` traits. A byte-level bigram model, AdamW and a top-k sampler are
//! provided as reference implementations.

pub mod accumulate;
pub mod bigram;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod iterator;
pub mod job;
pub mod layout;
pub mod model;
pub mod optimizer;
pub mod orchestrator;
pub mod progress;
pub mod sampling;
pub mod schedule;
pub mod state;
pub mod tensor;
pub mod tracking;

pub use accumulate::{AccumulatedGradient, GradientAccumulator};
pub use bigram::{BigramLoss, BigramModel};
pub use checkpoint::{CheckpointEntry, CheckpointStore};
pub use config::{load_model_config, model_config_path};
pub use dataset::{write_jsonl_shards, InMemorySource, SequenceRecord, SequenceSource, ShardedJsonlSource};
pub use error::{TrainingError, TrainingResult};
pub use iterator::{IteratorOptions, ResumableSequenceIterator, PAD_TOKEN};
pub use job::TrainingHyperParams;
pub use model::{Batch, LossFn, Model, Optimizer, Sampler};
pub use optimizer::{classify, AdamW, AdamWConfig, AdamWState, DecayClass, DecayMask};
pub use orchestrator::{Collaborators, Phase, StopReason, TrainingOrchestrator, TrainingSummary};
pub use progress::{LogProgressSink, NullProgressSink, ProgressEvent, ProgressSink};
pub use sampling::{decode_tokens, TopKSampler};
pub use schedule::{PeriodicTask, Schedule};
pub use state::{Bootstrap, ModelConfig, RunId, TrainingState};
pub use tensor::{ParamTree, Tensor};
pub use tracking::{DisabledTracker, LocalTracker, MetricValue, Metrics, Tracker};
