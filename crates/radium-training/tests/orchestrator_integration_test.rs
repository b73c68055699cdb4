//! End-to-end runs of the training loop against in-memory data.

use radium_training::{
    classify, AdamW, AdamWConfig, AdamWState, BigramLoss, BigramModel, Bootstrap, CheckpointStore, Collaborators,
    DecayMask, DisabledTracker, InMemorySource, LocalTracker, LossFn, Model, ModelConfig, NullProgressSink, Optimizer,
    ParamTree, Phase, ProgressEvent, ProgressSink, Schedule, StopReason, TopKSampler, Tracker, TrainingHyperParams,
    TrainingOrchestrator, TrainingResult, TrainingState, TrainingSummary,
};
use std::cell::Cell;
use std::sync::Mutex;
use tempfile::TempDir;

const SEQ_LEN: usize = 16;

fn model_config() -> ModelConfig {
    ModelConfig::from_toml_str(&format!("seq_len = {SEQ_LEN}\nvocab_size = 128\n")).unwrap()
}

fn corpus(n: usize) -> Vec<Vec<u8>> {
    (0..n).map(|i| format!("row {i:04} quick brown fox").into_bytes()).collect()
}

fn hyper(batch_size: u32, grad_accum_every: u32, epochs: u32) -> TrainingHyperParams {
    TrainingHyperParams {
        seed: 7,
        epochs,
        learning_rate: 1e-2,
        batch_size,
        grad_accum_every,
        ..Default::default()
    }
}

fn quiet_schedule(checkpoint_every: u64) -> Schedule {
    Schedule {
        checkpoint_every,
        checkpoint_keep_n: 10,
        validate_every: 1_000,
        sample_every: 1_000,
        prime_length: 4,
        sample_top_k: 5,
    }
}

#[derive(Default)]
struct RecordingSink(Mutex<Vec<ProgressEvent>>);

impl RecordingSink {
    fn events(&self) -> Vec<ProgressEvent> {
        self.0.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn on_event(&self, event: ProgressEvent) {
        self.0.lock().unwrap().push(event);
    }
}

struct BigramRun {
    model: BigramModel,
    loss: BigramLoss,
    optimizer: AdamW,
    sampler: TopKSampler,
}

impl BigramRun {
    fn new(hp: &TrainingHyperParams) -> Self {
        let model = BigramModel::from_config(&model_config()).unwrap();
        let params = model.init(hp.seed, &[0; SEQ_LEN]).unwrap();
        let optimizer = AdamW::new(AdamWConfig::from_hyper_params(hp), DecayMask::from_params(&params, classify));
        Self { model, loss: BigramLoss::new(model), optimizer, sampler: TopKSampler::default() }
    }

    fn fresh_state(&self, seed: u64) -> TrainingState<AdamWState> {
        Bootstrap::Fresh { model_config: model_config() }
            .into_state(&self.model, &self.optimizer, seed)
            .unwrap()
    }

    #[allow(clippy::too_many_arguments)]
    fn run(
        &self,
        hp: TrainingHyperParams,
        schedule: Schedule,
        store: &CheckpointStore,
        state: TrainingState<AdamWState>,
        data: &[Vec<u8>],
        tracker: &mut dyn Tracker,
        progress: &dyn ProgressSink,
    ) -> (TrainingSummary, TrainingState<AdamWState>) {
        let train = InMemorySource::new(data.to_vec()).with_reshuffle(hp.seed);
        let valid = InMemorySource::new(corpus(8));
        let collab = Collaborators {
            model: &self.model,
            loss: &self.loss,
            optimizer: &self.optimizer,
            sampler: &self.sampler,
            tracker,
            progress,
        };
        let mut orchestrator = TrainingOrchestrator::new(
            hp,
            schedule,
            store.clone(),
            state,
            Box::new(train),
            Box::new(valid),
            collab,
        )
        .unwrap();
        let summary = orchestrator.run().unwrap();
        (summary, orchestrator.into_state())
    }
}

#[test]
fn test_first_checkpoint_lands_after_one_effective_batch() {
    let temp = TempDir::new().unwrap();
    let store = CheckpointStore::new(temp.path());
    let hp = TrainingHyperParams { max_steps: Some(1), ..hyper(4, 4, 1) };
    let run = BigramRun::new(&hp);

    let (summary, _) = run.run(
        hp,
        quiet_schedule(1),
        &store,
        run.fresh_state(7),
        &corpus(1000),
        &mut DisabledTracker,
        &NullProgressSink,
    );

    assert_eq!(summary.stop_reason, StopReason::StepBudgetExhausted);
    assert_eq!(summary.next_seq_index, 16);
    // The budget stop does not write a second entry for an already checkpointed step.
    assert_eq!(store.list().unwrap().len(), 1);
    let saved = store.get_last::<AdamWState>().unwrap().unwrap();
    assert_eq!(saved.next_seq_index, 16);
    assert_eq!(saved.step, 1);
}

#[test]
fn test_resumed_run_matches_uninterrupted_run() {
    let data = corpus(40);
    let hp = hyper(2, 2, 2);
    let run = BigramRun::new(&hp);

    let straight_dir = TempDir::new().unwrap();
    let (straight, straight_state) = run.run(
        hp.clone(),
        quiet_schedule(1_000),
        &CheckpointStore::new(straight_dir.path()),
        run.fresh_state(hp.seed),
        &data,
        &mut DisabledTracker,
        &NullProgressSink,
    );
    assert_eq!(straight.stop_reason, StopReason::EpochsCompleted);
    assert_eq!(straight.final_step, 20);
    assert_eq!(straight.next_seq_index, 80);
    assert_eq!(straight.epochs_completed, 2);

    let split_dir = TempDir::new().unwrap();
    let runs_dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(split_dir.path());

    let mut tracker = LocalTracker::new(runs_dir.path(), "resume");
    let interrupted_hp = TrainingHyperParams { max_steps: Some(7), ..hp.clone() };
    let (first, first_state) = run.run(
        interrupted_hp,
        quiet_schedule(1_000),
        &store,
        run.fresh_state(hp.seed),
        &data,
        &mut tracker,
        &NullProgressSink,
    );
    assert_eq!(first.steps_run, 7);
    assert_eq!(first.stop_reason, StopReason::StepBudgetExhausted);

    let resumed = store.get_last::<AdamWState>().unwrap().unwrap();
    assert_eq!(resumed.next_seq_index, 28);
    assert_eq!(resumed.run_id, first_state.run_id);

    let mut tracker = LocalTracker::new(runs_dir.path(), "resume");
    let (second, second_state) = run.run(
        hp,
        quiet_schedule(1_000),
        &store,
        resumed,
        &data,
        &mut tracker,
        &NullProgressSink,
    );

    assert_eq!(second.steps_run, 13);
    assert_eq!(second.next_seq_index, straight.next_seq_index);
    assert_eq!(second_state.run_id, first_state.run_id);
    assert!(second_state.params.bit_eq(&straight_state.params));
    assert_eq!(second_state.optimizer_state.count, straight_state.optimizer_state.count);
}

#[test]
fn test_cadence_is_global_across_epochs() {
    let temp = TempDir::new().unwrap();
    let hp = hyper(2, 2, 3);
    let run = BigramRun::new(&hp);
    let sink = RecordingSink::default();

    let schedule = Schedule { validate_every: 4, sample_every: 5, ..quiet_schedule(2) };
    let (summary, _) = run.run(
        hp,
        schedule,
        &CheckpointStore::new(temp.path()),
        run.fresh_state(7),
        &corpus(12),
        &mut DisabledTracker,
        &sink,
    );
    assert_eq!(summary.final_step, 9);

    let events = sink.events();
    let checkpoints: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Checkpointed { step, .. } => Some(*step),
            _ => None,
        })
        .collect();
    let validations: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Validated { step, .. } => Some(*step),
            _ => None,
        })
        .collect();
    let epochs = events.iter().filter(|e| matches!(e, ProgressEvent::EpochStarted { .. })).count();

    assert_eq!(checkpoints, vec![0, 2, 4, 6, 8]);
    assert_eq!(validations, vec![0, 4, 8]);
    assert_eq!(epochs, 3);
}

#[test]
fn test_tasks_run_in_checkpoint_validate_sample_order() {
    let temp = TempDir::new().unwrap();
    let hp = TrainingHyperParams { max_steps: Some(1), ..hyper(2, 1, 1) };
    let run = BigramRun::new(&hp);
    let sink = RecordingSink::default();

    run.run(
        hp,
        quiet_schedule(1),
        &CheckpointStore::new(temp.path()),
        run.fresh_state(7),
        &corpus(10),
        &mut DisabledTracker,
        &sink,
    );

    let kinds: Vec<&str> = sink
        .events()
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Checkpointed { .. } => Some("checkpoint"),
            ProgressEvent::Validated { .. } => Some("validate"),
            ProgressEvent::Sampled { prime, .. } => {
                assert_eq!(prime, "row ");
                Some("sample")
            }
            _ => None,
        })
        .collect();
    assert_eq!(kinds, vec!["checkpoint", "validate", "sample"]);
}

#[test]
fn test_budget_stop_writes_final_checkpoint() {
    let temp = TempDir::new().unwrap();
    let store = CheckpointStore::new(temp.path());
    let hp = TrainingHyperParams { max_steps: Some(5), ..hyper(2, 2, 10) };
    let run = BigramRun::new(&hp);

    let (summary, _) = run.run(
        hp,
        quiet_schedule(1_000),
        &store,
        run.fresh_state(7),
        &corpus(30),
        &mut DisabledTracker,
        &NullProgressSink,
    );

    assert_eq!(summary.steps_run, 5);
    let entries = store.list().unwrap();
    assert_eq!(entries.len(), 2);
    let last = store.get_last::<AdamWState>().unwrap().unwrap();
    assert_eq!(last.step, 5);
    assert_eq!(last.next_seq_index, 20);
}

#[test]
fn test_completed_run_checkpoints_its_last_step() {
    let temp = TempDir::new().unwrap();
    let store = CheckpointStore::new(temp.path());
    let hp = hyper(2, 2, 1);
    let run = BigramRun::new(&hp);

    let (summary, state) = run.run(
        hp,
        quiet_schedule(1_000),
        &store,
        run.fresh_state(7),
        &corpus(20),
        &mut DisabledTracker,
        &NullProgressSink,
    );
    assert_eq!(summary.stop_reason, StopReason::EpochsCompleted);
    assert_eq!(summary.final_step, 5);

    // Step 0 from the cadence, step 4 on completion.
    assert_eq!(store.list().unwrap().len(), 2);
    let saved = store.get_last::<AdamWState>().unwrap().unwrap();
    assert_eq!(saved.step, 5);
    assert_eq!(saved.next_seq_index, 20);
    assert!(saved.params.bit_eq(&state.params));
    assert_eq!(saved.optimizer_state.count, state.optimizer_state.count);
}

#[test]
fn test_finished_run_does_nothing_when_resumed() {
    let temp = TempDir::new().unwrap();
    let store = CheckpointStore::new(temp.path());
    let hp = hyper(2, 2, 1);
    let run = BigramRun::new(&hp);

    let (done, state) = run.run(
        hp.clone(),
        quiet_schedule(1_000),
        &store,
        run.fresh_state(7),
        &corpus(8),
        &mut DisabledTracker,
        &NullProgressSink,
    );
    assert_eq!(done.final_step, 2);

    let (again, _) = run.run(
        hp,
        quiet_schedule(1_000),
        &store,
        state,
        &corpus(8),
        &mut DisabledTracker,
        &NullProgressSink,
    );
    assert_eq!(again.steps_run, 0);
    assert_eq!(again.next_seq_index, 8);
}

/// Optimizer whose state counts the updates it has produced.
struct CountingOptimizer;

impl Optimizer for CountingOptimizer {
    type State = u64;

    fn init(&self, _params: &ParamTree) -> u64 {
        0
    }

    fn update(&self, gradients: &ParamTree, state: &u64, _params: &ParamTree) -> TrainingResult<(ParamTree, u64)> {
        let mut updates = gradients.clone();
        updates.scale(-0.1);
        Ok((updates, state + 1))
    }
}

struct CountingLoss {
    inner: BigramLoss,
    calls: Cell<u64>,
}

impl LossFn for CountingLoss {
    fn compute(&self, params: &ParamTree, seed: u64, batch: &[Vec<u8>]) -> TrainingResult<(f32, ParamTree)> {
        self.calls.set(self.calls.get() + 1);
        self.inner.compute(params, seed, batch)
    }
}

#[test]
fn test_one_optimizer_update_per_accumulation_window() {
    let temp = TempDir::new().unwrap();
    let model = BigramModel::from_config(&model_config()).unwrap();
    let loss = CountingLoss { inner: BigramLoss::new(model), calls: Cell::new(0) };
    let optimizer = CountingOptimizer;
    let sampler = TopKSampler::default();
    let mut tracker = DisabledTracker;

    let hp = TrainingHyperParams { max_steps: Some(6), ..hyper(3, 4, 5) };
    let state = Bootstrap::<u64>::Fresh { model_config: model_config() }
        .into_state(&model, &optimizer, hp.seed)
        .unwrap();
    let collab = Collaborators {
        model: &model,
        loss: &loss,
        optimizer: &optimizer,
        sampler: &sampler,
        tracker: &mut tracker,
        progress: &NullProgressSink,
    };
    let mut orchestrator = TrainingOrchestrator::new(
        hp,
        quiet_schedule(1_000),
        CheckpointStore::new(temp.path()),
        state,
        Box::new(InMemorySource::new(corpus(50))),
        Box::new(InMemorySource::new(corpus(5))),
        collab,
    )
    .unwrap();
    assert_eq!(orchestrator.phase(), Phase::Init);
    let summary = orchestrator.run().unwrap();
    assert_eq!(orchestrator.phase(), Phase::Finished);
    let state = orchestrator.into_state();

    assert_eq!(summary.steps_run, 6);
    assert_eq!(state.optimizer_state, 6);
    assert_eq!(state.next_seq_index, 6 * 12);
    // Four micro-batches per step plus the validation pass after step 0.
    assert_eq!(loss.calls.get(), 6 * 4 + 1);
}

#[test]
fn test_prime_length_must_be_shorter_than_seq_len() {
    let temp = TempDir::new().unwrap();
    let hp = hyper(2, 1, 1);
    let run = BigramRun::new(&hp);
    let mut tracker = DisabledTracker;
    let collab = Collaborators {
        model: &run.model,
        loss: &run.loss,
        optimizer: &run.optimizer,
        sampler: &run.sampler,
        tracker: &mut tracker,
        progress: &NullProgressSink,
    };
    let schedule = Schedule { prime_length: SEQ_LEN, ..quiet_schedule(1) };
    let result = TrainingOrchestrator::new(
        hp,
        schedule,
        CheckpointStore::new(temp.path()),
        run.fresh_state(7),
        Box::new(InMemorySource::new(corpus(4))),
        Box::new(InMemorySource::new(corpus(4))),
        collab,
    );
    assert!(matches!(result, Err(radium_training::TrainingError::Configuration(_))));
}
