//! rad-train - resumable training runs
//!
//! Trains the reference byte-level model on a folder of JSONL shards,
//! checkpointing as it goes. Re-running the same command resumes from the
//! newest checkpoint; `--new` clears the checkpoints and starts over.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// rad-train - resumable training with periodic checkpoints, validation and sampling
#[derive(Parser, Debug)]
#[command(name = "rad-train", author, version, about = "Radium - resumable training runs")]
pub struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Seed for parameter init, data reshuffles and per-step randomness
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Sequences per micro-batch
    #[arg(long, default_value_t = 4)]
    pub batch_size: u32,

    /// Micro-batches per optimizer update
    #[arg(long, default_value_t = 4)]
    pub grad_accum_every: u32,

    #[arg(long, default_value_t = 100)]
    pub epochs: u32,

    #[arg(long, default_value_t = 2e-4)]
    pub learning_rate: f64,

    #[arg(long, default_value_t = 1e-3)]
    pub weight_decay: f64,

    #[arg(long, default_value_t = 0.5)]
    pub max_grad_norm: f64,

    /// Steps between validation passes
    #[arg(long, default_value_t = 100)]
    pub validate_every: u64,

    /// Steps between text samples
    #[arg(long, default_value_t = 500)]
    pub sample_every: u64,

    /// Steps between checkpoints
    #[arg(long, default_value_t = 1000)]
    pub checkpoint_every: u64,

    /// Checkpoint directory
    #[arg(long, default_value = "./ckpts")]
    pub checkpoint_path: PathBuf,

    /// Checkpoints kept on disk, oldest evicted first
    #[arg(long, default_value_t = 500)]
    pub checkpoint_keep_n: usize,

    /// Directory of `<model-name>.toml` model configs
    #[arg(long, default_value = "./configs/model")]
    pub config_path: PathBuf,

    #[arg(long, default_value = "default")]
    pub model_name: String,

    /// Tokens of a held-out sequence used to prime sampling
    #[arg(long, default_value_t = 25)]
    pub prime_length: usize,

    /// Overrides the model config's seq_len for a fresh run
    #[arg(long)]
    pub seq_len: Option<usize>,

    /// Folder of `<shard>.<count>.<split>.jsonl` files with train and valid splits
    #[arg(long, default_value = "./train_data")]
    pub data_path: PathBuf,

    /// Disable experiment tracking
    #[arg(long)]
    pub tracking_off: bool,

    #[arg(long, default_value = "radium-training")]
    pub project_name: String,

    /// Root directory for local run tracking
    #[arg(long, default_value = "./runs")]
    pub tracking_dir: PathBuf,

    /// Clear all checkpoints and start a fresh run
    #[arg(long)]
    pub new: bool,

    /// Answer yes to the `--new` confirmation
    #[arg(short, long)]
    pub yes: bool,

    /// Stop after this many optimizer steps, writing a final checkpoint
    #[arg(long)]
    pub max_steps: Option<u64>,

    /// Candidates kept per sampling step
    #[arg(long, default_value_t = 25)]
    pub top_k: usize,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber =
        FmtSubscriber::builder().with_max_level(level).without_time().with_target(false).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    commands::train::execute(&args)
}
