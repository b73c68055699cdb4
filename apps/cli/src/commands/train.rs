//! The training run: bootstrap, wire collaborators, run the loop, report.

use crate::Args;
use crate::commands::progress::BarProgressSink;
use anyhow::{Context, Result};
use colored::Colorize;
use inquire::Confirm;
use radium_training::{
    classify, AdamW, AdamWConfig, AdamWState, BigramLoss, BigramModel, Bootstrap, CheckpointStore, Collaborators,
    DecayMask, DisabledTracker, LocalTracker, LogProgressSink, Model, ProgressSink, Schedule, ShardedJsonlSource,
    StopReason, TopKSampler, Tracker, TrainingError, TrainingHyperParams, TrainingOrchestrator,
};
use std::io::IsTerminal;

pub fn execute(args: &Args) -> Result<()> {
    let hyper = TrainingHyperParams {
        seed: args.seed,
        epochs: args.epochs,
        learning_rate: args.learning_rate,
        weight_decay: args.weight_decay,
        max_grad_norm: args.max_grad_norm,
        batch_size: args.batch_size,
        grad_accum_every: args.grad_accum_every,
        max_steps: args.max_steps,
    };
    let schedule = Schedule {
        checkpoint_every: args.checkpoint_every,
        checkpoint_keep_n: args.checkpoint_keep_n,
        validate_every: args.validate_every,
        sample_every: args.sample_every,
        prime_length: args.prime_length,
        sample_top_k: args.top_k,
    };
    hyper.validate().context("Invalid training options")?;
    schedule.validate().context("Invalid schedule options")?;

    let store = CheckpointStore::new(&args.checkpoint_path);
    if args.new && !reset_checkpoints(&store, args.yes)? {
        return Ok(());
    }

    let bootstrap = Bootstrap::<AdamWState>::resolve(&store, &args.config_path, &args.model_name)
        .context("Failed to determine the starting point of the run")?
        .with_seq_len(args.seq_len);

    println!();
    if bootstrap.is_resumed() {
        let existing = store.list().context("Failed to list checkpoints")?;
        println!(
            "{} {} ({} on disk)",
            "Resuming from checkpoint in".bold().cyan(),
            store.root().display(),
            existing.len()
        );
    } else {
        println!("{} {}", "Starting a fresh run of".bold().cyan(), args.model_name.cyan());
    }

    let model = BigramModel::from_config(bootstrap.model_config()).context("Invalid model config")?;
    let mask = match &bootstrap {
        Bootstrap::Resumed(state) => DecayMask::from_params(&state.params, classify),
        Bootstrap::Fresh { model_config } => {
            let probe = model.init(args.seed, &vec![0; model_config.seq_len()?])?;
            DecayMask::from_params(&probe, classify)
        }
    };
    let optimizer = AdamW::new(AdamWConfig::from_hyper_params(&hyper), mask);
    let loss = BigramLoss::new(model);
    let sampler = TopKSampler::default();
    let state = bootstrap.into_state(&model, &optimizer, args.seed)?;

    let train = ShardedJsonlSource::open(&args.data_path, "train")
        .context("Failed to open training data")?
        .with_reshuffle(args.seed);
    let valid = ShardedJsonlSource::open(&args.data_path, "valid")
        .context("Failed to open validation data")?
        .with_reshuffle(args.seed);

    let mut tracker: Box<dyn Tracker> = if args.tracking_off {
        Box::new(DisabledTracker)
    } else {
        Box::new(LocalTracker::new(&args.tracking_dir, &args.project_name))
    };
    // Piped output gets log lines instead of a redrawn bar.
    let progress: Box<dyn ProgressSink> = if std::io::stdout().is_terminal() {
        Box::new(BarProgressSink::new())
    } else {
        Box::new(LogProgressSink)
    };

    let collab = Collaborators {
        model: &model,
        loss: &loss,
        optimizer: &optimizer,
        sampler: &sampler,
        tracker: tracker.as_mut(),
        progress: progress.as_ref(),
    };
    let mut orchestrator = TrainingOrchestrator::new(
        hyper,
        schedule,
        store,
        state,
        Box::new(train),
        Box::new(valid),
        collab,
    )
    .context("Failed to set up training")?;
    let summary = orchestrator.run().context("Training failed")?;
    let run_id = orchestrator.state().run_id.clone();

    println!();
    match summary.stop_reason {
        StopReason::EpochsCompleted => println!("{}", "Training complete".bold().green()),
        StopReason::StepBudgetExhausted => println!("{}", "Step budget reached".bold().yellow()),
    }
    println!("  Steps this run: {}", summary.steps_run);
    println!("  Global step: {}", summary.final_step);
    println!("  Next sequence: {}", summary.next_seq_index);
    println!("  Epochs completed: {}", summary.epochs_completed);
    if let Some(loss) = summary.last_loss {
        println!("  Last loss: {}", format!("{loss:.4}").yellow());
    }
    if let Some(id) = run_id {
        println!("  Run: {}", id.to_string().dimmed());
    }
    println!();
    Ok(())
}

/// Clears the checkpoint directory. Returns `false` when the user declines.
fn reset_checkpoints(store: &CheckpointStore, assume_yes: bool) -> Result<bool> {
    let result = store.reset(|prompt| {
        if assume_yes {
            return Ok(true);
        }
        Confirm::new(prompt)
            .with_default(false)
            .prompt()
            .map_err(|e| TrainingError::Other(e.into()))
    });

    match result {
        Ok(removed) => {
            println!("{} {}", "Cleared checkpoints:".yellow(), removed);
            Ok(true)
        }
        Err(TrainingError::DestructiveActionDeclined(_)) => {
            println!("{}", "Reset cancelled, checkpoints kept.".yellow());
            Ok(false)
        }
        Err(e) => Err(e).context("Failed to clear checkpoints"),
    }
}
