use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { start_seq_index: u64, total_sequences: u64, num_params: usize, seq_len: usize },
    EpochStarted { epoch: u32, epochs: u32, steps: u64 },
    Step { step: u64, loss: f32 },
    Checkpointed { step: u64, next_seq_index: u64, index: u64 },
    Validated { step: u64, loss: f32 },
    Sampled { step: u64, prime: String, generated: String },
    Finished { steps_run: u64, next_seq_index: u64 },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Forwards progress to `tracing`.
#[derive(Debug, Default)]
pub struct LogProgressSink;

impl ProgressSink for LogProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { start_seq_index, total_sequences, num_params, seq_len } => {
                info!(start_seq_index, total_sequences, num_params, seq_len, "training started");
            }
            ProgressEvent::EpochStarted { epoch, epochs, steps } => info!(epoch, epochs, steps, "epoch started"),
            ProgressEvent::Step { step, loss } => info!(step, loss, "step"),
            ProgressEvent::Checkpointed { step, next_seq_index, index } => {
                info!(step, next_seq_index, index, "checkpoint saved");
            }
            ProgressEvent::Validated { step, loss } => info!(step, valid_loss = loss, "validated"),
            ProgressEvent::Sampled { step, prime, generated } => info!(step, %prime, %generated, "sampled"),
            ProgressEvent::Finished { steps_run, next_seq_index } => {
                info!(steps_run, next_seq_index, "training finished");
            }
        }
    }
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn on_event(&self, _event: ProgressEvent) {}
}
