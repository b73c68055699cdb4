//! Experiment tracking.
//!
//! A tracker is an explicit handle with the lifecycle `init → log* → close`.
//! [`DisabledTracker`] turns tracking off entirely; [`LocalTracker`] keeps one
//! directory per run with a metadata file and an append-only metrics log, and
//! re-attaches to an existing run when resuming.

use crate::error::{TrainingError, TrainingResult};
use crate::state::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Sample { prime: String, generated: String },
}

pub type Metrics = BTreeMap<String, MetricValue>;

pub trait Tracker {
    /// Starts a session, or re-attaches to `resume`. Returns the session id,
    /// `None` when tracking is disabled.
    fn init(&mut self, resume: Option<&RunId>) -> TrainingResult<Option<RunId>>;

    /// Records a run-level attribute such as the parameter count.
    fn record_config(&mut self, key: &str, value: serde_json::Value) -> TrainingResult<()>;

    fn log(&mut self, step: u64, metrics: &Metrics) -> TrainingResult<()>;

    fn close(&mut self) -> TrainingResult<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledTracker;

impl Tracker for DisabledTracker {
    fn init(&mut self, _resume: Option<&RunId>) -> TrainingResult<Option<RunId>> {
        Ok(None)
    }

    fn record_config(&mut self, _key: &str, _value: serde_json::Value) -> TrainingResult<()> {
        Ok(())
    }

    fn log(&mut self, _step: u64, _metrics: &Metrics) -> TrainingResult<()> {
        Ok(())
    }

    fn close(&mut self) -> TrainingResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub project: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resumed_at: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct MetricLine<'a> {
    step: u64,
    timestamp: DateTime<Utc>,
    metrics: &'a Metrics,
}

#[derive(Debug)]
struct ActiveRun {
    dir: PathBuf,
    record: RunRecord,
    metrics: BufWriter<File>,
}

/// Tracks runs under `<root>/<project>/<run_id>/`.
#[derive(Debug)]
pub struct LocalTracker {
    root: PathBuf,
    project: String,
    run: Option<ActiveRun>,
}

impl LocalTracker {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, project: impl Into<String>) -> Self {
        Self { root: root.into(), project: project.into(), run: None }
    }

    #[must_use]
    pub fn run_dir(&self, id: &RunId) -> PathBuf {
        self.root.join(&self.project).join(id.0.as_str())
    }

    fn active(&mut self) -> TrainingResult<&mut ActiveRun> {
        self.run
            .as_mut()
            .ok_or_else(|| TrainingError::Tracking("tracker used before init".to_string()))
    }
}

fn tracking_err(path: &Path, e: impl std::fmt::Display) -> TrainingError {
    TrainingError::Tracking(format!("{}: {e}", path.display()))
}

fn write_record(dir: &Path, record: &RunRecord) -> TrainingResult<()> {
    let path = dir.join("run.json");
    let json = serde_json::to_string_pretty(record)?;
    std::fs::write(&path, json).map_err(|e| tracking_err(&path, e))
}

impl Tracker for LocalTracker {
    fn init(&mut self, resume: Option<&RunId>) -> TrainingResult<Option<RunId>> {
        let id = resume.cloned().unwrap_or_default();
        let dir = self.run_dir(&id);
        std::fs::create_dir_all(&dir).map_err(|e| tracking_err(&dir, e))?;

        let record_path = dir.join("run.json");
        let record = if record_path.exists() {
            let bytes = std::fs::read(&record_path).map_err(|e| tracking_err(&record_path, e))?;
            let mut record: RunRecord = serde_json::from_slice(&bytes).map_err(|e| tracking_err(&record_path, e))?;
            record.resumed_at.push(Utc::now());
            info!(run_id = %id, "re-attached to tracking run");
            record
        } else {
            if resume.is_some() {
                warn!(run_id = %id, "no local record for resumed run, starting a new one under the same id");
            }
            RunRecord {
                id: id.clone(),
                project: self.project.clone(),
                created_at: Utc::now(),
                resumed_at: Vec::new(),
                config: BTreeMap::new(),
            }
        };
        write_record(&dir, &record)?;

        let metrics_path = dir.join("metrics.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&metrics_path)
            .map_err(|e| tracking_err(&metrics_path, e))?;

        self.run = Some(ActiveRun { dir, record, metrics: BufWriter::new(file) });
        Ok(Some(id))
    }

    fn record_config(&mut self, key: &str, value: serde_json::Value) -> TrainingResult<()> {
        let run = self.active()?;
        run.record.config.insert(key.to_string(), value);
        write_record(&run.dir, &run.record)
    }

    fn log(&mut self, step: u64, metrics: &Metrics) -> TrainingResult<()> {
        let run = self.active()?;
        let line = serde_json::to_string(&MetricLine { step, timestamp: Utc::now(), metrics })?;
        writeln!(run.metrics, "{line}")
            .and_then(|()| run.metrics.flush())
            .map_err(|e| tracking_err(&run.dir, e))
    }

    fn close(&mut self) -> TrainingResult<()> {
        if let Some(mut run) = self.run.take() {
            run.metrics.flush().map_err(|e| tracking_err(&run.dir, e))?;
        }
        Ok(())
    }
}
