//! The step/epoch loop.
//!
//! One [`TrainingOrchestrator`] owns the [`TrainingState`] for the duration of a
//! run. Each step draws `grad_accum_every` micro-batches, folds their gradients,
//! applies one optimizer update and advances `next_seq_index` by the effective
//! batch size. After a step the periodic tasks due on its global index run in
//! the order checkpoint, validate, sample.
//!
//! Epochs are ranges over the global sequence counter: with `S` steps per epoch
//! and effective batch `eff`, epoch `e` covers offsets `[(e-1)·S·eff, e·S·eff)`.
//! A resumed run therefore finishes the partially completed epoch first.
//!
//! Whatever ends the run, the last completed step is checkpointed before
//! returning unless the cadence already saved it.

use crate::accumulate::{AccumulatedGradient, GradientAccumulator};
use crate::checkpoint::CheckpointStore;
use crate::dataset::SequenceSource;
use crate::error::{TrainingError, TrainingResult};
use crate::iterator::{IteratorOptions, ResumableSequenceIterator};
use crate::job::TrainingHyperParams;
use crate::model::{LossFn, Model, Optimizer, Sampler};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::schedule::{PeriodicTask, Schedule};
use crate::state::TrainingState;
use crate::tracking::{MetricValue, Metrics, Tracker};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

const VALIDATE_LANE: u64 = u64::MAX;
const SAMPLE_LANE: u64 = u64::MAX - 1;

type Stream<'a> = ResumableSequenceIterator<Box<dyn SequenceSource + 'a>>;

/// External components the loop drives. None of them is owned by the orchestrator.
pub struct Collaborators<'a, O> {
    pub model: &'a dyn Model,
    pub loss: &'a dyn LossFn,
    pub optimizer: &'a O,
    pub sampler: &'a dyn Sampler,
    pub tracker: &'a mut dyn Tracker,
    pub progress: &'a dyn ProgressSink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Stepping,
    Checkpointing,
    Validating,
    Sampling,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EpochsCompleted,
    StepBudgetExhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    /// Steps completed by this invocation.
    pub steps_run: u64,
    /// Global step counter at exit.
    pub final_step: u64,
    pub next_seq_index: u64,
    /// Epochs fully covered by `next_seq_index`.
    pub epochs_completed: u32,
    pub last_loss: Option<f32>,
    pub stop_reason: StopReason,
}

pub struct TrainingOrchestrator<'a, O: Optimizer> {
    hyper: TrainingHyperParams,
    schedule: Schedule,
    store: CheckpointStore,
    state: TrainingState<O::State>,
    train: Stream<'a>,
    valid: Stream<'a>,
    accumulator: GradientAccumulator,
    collab: Collaborators<'a, O>,
    seq_len: usize,
    steps_per_epoch: u64,
    phase: Phase,
    last_checkpointed_step: Option<u64>,
}

impl<'a, O: Optimizer> TrainingOrchestrator<'a, O> {
    /// Validates settings, builds both streams and attaches the tracker.
    ///
    /// The training stream resumes at `state.next_seq_index`; the validation
    /// stream always starts from its first sequence. Both loop.
    pub fn new(
        hyper: TrainingHyperParams,
        schedule: Schedule,
        store: CheckpointStore,
        mut state: TrainingState<O::State>,
        train_source: Box<dyn SequenceSource + 'a>,
        valid_source: Box<dyn SequenceSource + 'a>,
        mut collab: Collaborators<'a, O>,
    ) -> TrainingResult<Self> {
        hyper.validate()?;
        schedule.validate()?;
        let seq_len = state.model_config.seq_len()?;
        if schedule.prime_length >= seq_len {
            return Err(TrainingError::Configuration(format!(
                "prime_length {} must be shorter than seq_len {seq_len}",
                schedule.prime_length
            )));
        }

        let batch_size = hyper.batch_size as usize;
        let train = ResumableSequenceIterator::new(
            train_source,
            IteratorOptions { seq_len, batch_size, skip: state.next_seq_index, looping: true },
        )?;
        let valid = ResumableSequenceIterator::new(
            valid_source,
            IteratorOptions { seq_len, batch_size, skip: 0, looping: true },
        )?;
        let accumulator = GradientAccumulator::new(hyper.grad_accum_every)?;
        let steps_per_epoch = train.total().div_ceil(hyper.effective_batch_size());

        let run_id = collab.tracker.init(state.run_id.as_ref())?;
        if let Some(id) = &run_id {
            info!(run_id = %id, "experiment tracking attached");
        }
        state.run_id = run_id;
        let num_params = state.params.num_params();
        collab.tracker.record_config("num_params", serde_json::json!(num_params))?;
        collab
            .tracker
            .record_config("model_config", serde_json::to_value(&state.model_config)?)?;

        collab.progress.on_event(ProgressEvent::Started {
            start_seq_index: state.next_seq_index,
            total_sequences: train.total(),
            num_params,
            seq_len,
        });

        Ok(Self {
            hyper,
            schedule,
            store,
            state,
            train,
            valid,
            accumulator,
            collab,
            seq_len,
            steps_per_epoch,
            phase: Phase::Init,
            last_checkpointed_step: None,
        })
    }

    #[must_use]
    pub fn state(&self) -> &TrainingState<O::State> {
        &self.state
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn steps_per_epoch(&self) -> u64 {
        self.steps_per_epoch
    }

    #[must_use]
    pub fn into_state(self) -> TrainingState<O::State> {
        self.state
    }

    /// Runs until the configured epochs are done or `max_steps` is spent.
    /// The tracker is closed on every exit path.
    pub fn run(&mut self) -> TrainingResult<TrainingSummary> {
        let result = self.run_epochs();
        let closed = self.collab.tracker.close();
        let summary = result?;
        closed?;
        Ok(summary)
    }

    fn run_epochs(&mut self) -> TrainingResult<TrainingSummary> {
        let eff = self.hyper.effective_batch_size();
        let span = self.steps_per_epoch * eff;
        let start = self.state.next_seq_index;
        let mut epoch = u32::try_from(start / span + 1).unwrap_or(u32::MAX);
        let mut steps_in_epoch = (span - start % span).div_ceil(eff);

        let mut steps_run = 0u64;
        let mut last_loss = None;
        let mut stop_reason = StopReason::EpochsCompleted;

        'epochs: while epoch <= self.hyper.epochs {
            info!(epoch, epochs = self.hyper.epochs, steps = steps_in_epoch, "starting epoch");
            self.collab.progress.on_event(ProgressEvent::EpochStarted {
                epoch,
                epochs: self.hyper.epochs,
                steps: steps_in_epoch,
            });

            for _ in 0..steps_in_epoch {
                if self.hyper.max_steps.is_some_and(|max| steps_run >= max) {
                    stop_reason = StopReason::StepBudgetExhausted;
                    break 'epochs;
                }
                last_loss = Some(self.train_step()?);
                steps_run += 1;
                self.run_due_tasks()?;
            }

            epoch += 1;
            steps_in_epoch = self.steps_per_epoch;
        }

        if steps_run > 0 {
            let last = self.state.step - 1;
            if self.last_checkpointed_step != Some(last) {
                self.checkpoint(last)?;
            }
        }

        self.phase = Phase::Finished;
        self.collab.progress.on_event(ProgressEvent::Finished {
            steps_run,
            next_seq_index: self.state.next_seq_index,
        });

        let epochs_completed = u32::try_from(self.state.next_seq_index / span)
            .unwrap_or(u32::MAX)
            .min(self.hyper.epochs);
        Ok(TrainingSummary {
            steps_run,
            final_step: self.state.step,
            next_seq_index: self.state.next_seq_index,
            epochs_completed,
            last_loss,
            stop_reason,
        })
    }

    /// One optimizer step over `grad_accum_every` micro-batches. Returns the
    /// loss of the last micro-batch.
    fn train_step(&mut self) -> TrainingResult<f32> {
        self.phase = Phase::Stepping;
        let step = self.state.step;

        let mut window: Option<AccumulatedGradient> = None;
        for lane in 0..u64::from(self.accumulator.every()) {
            let batch = self
                .train
                .next_batch()?
                .ok_or_else(|| TrainingError::Dataset("training stream ended unexpectedly".to_string()))?;
            let seed = derive_seed(self.hyper.seed, step, lane);
            let (loss, gradients) = self.collab.loss.compute(&self.state.params, seed, &batch)?;
            window = self.accumulator.accumulate(loss, gradients)?;
        }
        let window = window.ok_or_else(|| TrainingError::Other(anyhow::anyhow!("accumulation window did not close")))?;

        let optimizer = self.collab.optimizer;
        let (updates, optimizer_state) =
            optimizer.update(&window.gradients, &self.state.optimizer_state, &self.state.params)?;
        self.state.params = optimizer.apply(&self.state.params, &updates)?;
        self.state.optimizer_state = optimizer_state;
        self.state.next_seq_index += self.hyper.effective_batch_size();
        self.state.step += 1;
        debug_assert_eq!(self.state.next_seq_index, self.train.position());

        debug!(step, loss = window.loss, "step complete");
        self.collab.tracker.log(step, &scalar("loss", window.loss))?;
        self.collab.progress.on_event(ProgressEvent::Step { step, loss: window.loss });
        Ok(window.loss)
    }

    fn run_due_tasks(&mut self) -> TrainingResult<()> {
        let step = self.state.step - 1;
        for task in self.schedule.due(step) {
            match task {
                PeriodicTask::Checkpoint => self.checkpoint(step)?,
                PeriodicTask::Validate => self.validate(step)?,
                PeriodicTask::Sample => self.sample(step)?,
            }
        }
        Ok(())
    }

    fn checkpoint(&mut self, step: u64) -> TrainingResult<()> {
        self.phase = Phase::Checkpointing;
        let entry = self.store.save(&self.state, self.schedule.checkpoint_keep_n)?;
        info!(
            step,
            next_seq_index = self.state.next_seq_index,
            index = entry.index,
            "checkpoint written"
        );
        self.last_checkpointed_step = Some(step);
        self.collab.progress.on_event(ProgressEvent::Checkpointed {
            step,
            next_seq_index: self.state.next_seq_index,
            index: entry.index,
        });
        Ok(())
    }

    fn next_held_out_batch(&mut self) -> TrainingResult<Vec<Vec<u8>>> {
        self.valid
            .next_batch()?
            .ok_or_else(|| TrainingError::Dataset("validation stream ended unexpectedly".to_string()))
    }

    fn validate(&mut self, step: u64) -> TrainingResult<()> {
        self.phase = Phase::Validating;
        let batch = self.next_held_out_batch()?;
        let seed = derive_seed(self.hyper.seed, step, VALIDATE_LANE);
        let (loss, _) = self.collab.loss.compute(&self.state.params, seed, &batch)?;
        info!(step, valid_loss = loss, "validation");
        self.collab.tracker.log(step, &scalar("valid_loss", loss))?;
        self.collab.progress.on_event(ProgressEvent::Validated { step, loss });
        Ok(())
    }

    fn sample(&mut self, step: u64) -> TrainingResult<()> {
        self.phase = Phase::Sampling;
        let batch = self.next_held_out_batch()?;
        let mut prime = batch.into_iter().next().unwrap_or_default();
        prime.truncate(self.schedule.prime_length);

        let seed = derive_seed(self.hyper.seed, step, SAMPLE_LANE);
        let sampler = self.collab.sampler;
        let sampled = sampler.sample(
            seed,
            self.collab.model,
            &self.state.params,
            &prime,
            self.seq_len,
            self.schedule.sample_top_k,
        )?;
        let prime_text = sampler.decode(&prime);
        let generated = sampler.decode(sampled.get(prime.len()..).unwrap_or_default());
        info!(step, prime = %prime_text, generated = %generated, "sample");

        let metrics = Metrics::from([(
            "samples".to_string(),
            MetricValue::Sample { prime: prime_text.clone(), generated: generated.clone() },
        )]);
        self.collab.tracker.log(step, &metrics)?;
        self.collab.progress.on_event(ProgressEvent::Sampled { step, prime: prime_text, generated });
        Ok(())
    }
}

fn scalar(name: &str, value: f32) -> Metrics {
    Metrics::from([(name.to_string(), MetricValue::Scalar(f64::from(value)))])
}

/// Seed for one unit of compute, a pure function of the run seed, the global
/// step and a lane within the step.
#[must_use]
pub fn derive_seed(seed: u64, step: u64, lane: u64) -> u64 {
    let mixed = seed ^ step.rotate_left(32) ^ lane.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    StdRng::seed_from_u64(mixed).r#gen()
}
