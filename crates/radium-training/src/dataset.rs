//! Indexed sequence sources.
//!
//! A source is a finite collection of token sequences addressed by position.
//! Each pass over the collection is a *cycle*; a source may present a
//! different order on every cycle after the first.

use crate::error::{TrainingError, TrainingResult};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

pub trait SequenceSource {
    /// Number of sequences in one cycle.
    fn count(&self) -> usize;

    /// The sequence at `position` (`< count()`) in the order used for `cycle`.
    fn sequence(&mut self, cycle: u64, position: usize) -> TrainingResult<Vec<u8>>;
}

impl<T: SequenceSource + ?Sized> SequenceSource for Box<T> {
    fn count(&self) -> usize {
        (**self).count()
    }

    fn sequence(&mut self, cycle: u64, position: usize) -> TrainingResult<Vec<u8>> {
        (**self).sequence(cycle, position)
    }
}

/// Deterministic permutation of `0..len` for `cycle`; cycle 0 keeps natural order.
fn cycle_permutation(len: usize, seed: Option<u64>, cycle: u64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    if let (Some(seed), true) = (seed, cycle > 0) {
        let mut rng = StdRng::seed_from_u64(seed ^ cycle.rotate_left(29));
        order.shuffle(&mut rng);
    }
    order
}

/// Sequences held in memory.
#[derive(Debug, Clone)]
pub struct InMemorySource {
    sequences: Vec<Vec<u8>>,
    reshuffle_seed: Option<u64>,
    order: Option<(u64, Vec<usize>)>,
}

impl InMemorySource {
    #[must_use]
    pub fn new(sequences: Vec<Vec<u8>>) -> Self {
        Self { sequences, reshuffle_seed: None, order: None }
    }

    /// Reorders sequences on every cycle after the first.
    #[must_use]
    pub fn with_reshuffle(mut self, seed: u64) -> Self {
        self.reshuffle_seed = Some(seed);
        self
    }
}

impl SequenceSource for InMemorySource {
    fn count(&self) -> usize {
        self.sequences.len()
    }

    fn sequence(&mut self, cycle: u64, position: usize) -> TrainingResult<Vec<u8>> {
        let index = match self.reshuffle_seed {
            None => position,
            Some(_) => {
                if self.order.as_ref().map(|(c, _)| *c) != Some(cycle) {
                    let order = cycle_permutation(self.sequences.len(), self.reshuffle_seed, cycle);
                    self.order = Some((cycle, order));
                }
                self.order
                    .as_ref()
                    .and_then(|(_, order)| order.get(position).copied())
                    .unwrap_or(position)
            }
        };
        self.sequences
            .get(index)
            .cloned()
            .ok_or_else(|| TrainingError::Dataset(format!("position {position} out of range")))
    }
}

/// One line of a JSONL shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceRecord {
    pub sequence: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
struct Shard {
    index: u64,
    count: usize,
    path: PathBuf,
}

/// Parses `<shard>.<count>.<split>.jsonl`.
fn parse_shard_name(file_name: &str, split: &str) -> Option<(u64, usize)> {
    let mut parts = file_name.split('.');
    let index = parts.next()?.parse().ok()?;
    let count = parts.next()?.parse().ok()?;
    if parts.next()? != split || parts.next()? != "jsonl" || parts.next().is_some() {
        return None;
    }
    Some((index, count))
}

/// A split stored as JSONL shards whose file names carry their sequence counts,
/// so `count()` never has to read shard contents.
///
/// Reshuffling permutes shard order per cycle; records inside a shard keep their order.
#[derive(Debug)]
pub struct ShardedJsonlSource {
    split: String,
    shards: Vec<Shard>,
    total: usize,
    reshuffle_seed: Option<u64>,
    layout: Option<CycleLayout>,
    loaded: Option<(usize, Vec<Vec<u8>>)>,
}

#[derive(Debug)]
struct CycleLayout {
    cycle: u64,
    order: Vec<usize>,
    /// Exclusive end position of each shard in `order`.
    ends: Vec<usize>,
}

impl ShardedJsonlSource {
    /// Discovers the shards of `split` under `folder`.
    pub fn open(folder: &Path, split: &str) -> TrainingResult<Self> {
        if !folder.is_dir() {
            return Err(TrainingError::Configuration(format!(
                "data folder {} does not exist",
                folder.display()
            )));
        }

        let mut shards = Vec::new();
        for entry in WalkDir::new(folder).follow_links(true) {
            let entry = entry.map_err(|e| TrainingError::Dataset(format!("failed to scan {}: {e}", folder.display())))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some((index, count)) = entry.file_name().to_str().and_then(|n| parse_shard_name(n, split)) else {
                continue;
            };
            shards.push(Shard { index, count, path: entry.into_path() });
        }
        shards.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.path.cmp(&b.path)));

        let total = shards.iter().map(|s| s.count).sum();
        debug!(split, shards = shards.len(), total, "discovered data shards");

        Ok(Self { split: split.to_string(), shards, total, reshuffle_seed: None, layout: None, loaded: None })
    }

    /// Permutes shard order on every cycle after the first.
    #[must_use]
    pub fn with_reshuffle(mut self, seed: u64) -> Self {
        self.reshuffle_seed = Some(seed);
        self
    }

    fn layout_for(&mut self, cycle: u64) -> &CycleLayout {
        if self.layout.as_ref().map(|l| l.cycle) != Some(cycle) {
            let order = cycle_permutation(self.shards.len(), self.reshuffle_seed, cycle);
            let mut end = 0;
            let ends = order
                .iter()
                .map(|i| {
                    end += self.shards[*i].count;
                    end
                })
                .collect();
            self.layout = Some(CycleLayout { cycle, order, ends });
        }
        self.layout.get_or_insert_with(|| CycleLayout { cycle, order: Vec::new(), ends: Vec::new() })
    }

    fn load_shard(&mut self, shard_idx: usize) -> TrainingResult<&[Vec<u8>]> {
        if self.loaded.as_ref().map(|(i, _)| *i) != Some(shard_idx) {
            let shard = &self.shards[shard_idx];
            let contents = std::fs::read_to_string(&shard.path)
                .map_err(|e| TrainingError::Dataset(format!("failed to read {}: {e}", shard.path.display())))?;

            let mut sequences = Vec::with_capacity(shard.count);
            for (line_no, line) in contents.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let record: SequenceRecord = serde_json::from_str(line).map_err(|e| {
                    TrainingError::Dataset(format!("{} line {}: {e}", shard.path.display(), line_no + 1))
                })?;
                sequences.push(record.sequence.into_bytes());
            }

            if sequences.len() != shard.count {
                return Err(TrainingError::Dataset(format!(
                    "shard {} declares {} sequences but contains {}",
                    shard.path.display(),
                    shard.count,
                    sequences.len()
                )));
            }
            self.loaded = Some((shard_idx, sequences));
        }

        Ok(self.loaded.as_ref().map(|(_, s)| s.as_slice()).unwrap_or_default())
    }
}

impl SequenceSource for ShardedJsonlSource {
    fn count(&self) -> usize {
        self.total
    }

    fn sequence(&mut self, cycle: u64, position: usize) -> TrainingResult<Vec<u8>> {
        if position >= self.total {
            return Err(TrainingError::Dataset(format!(
                "position {position} out of range for {} {} sequences",
                self.total, self.split
            )));
        }

        let layout = self.layout_for(cycle);
        let slot = layout.ends.partition_point(|end| *end <= position);
        let start = if slot == 0 { 0 } else { layout.ends[slot - 1] };
        let shard_idx = layout.order[slot];

        let sequences = self.load_shard(shard_idx)?;
        sequences
            .get(position - start)
            .cloned()
            .ok_or_else(|| TrainingError::Dataset(format!("position {position} missing from shard")))
    }
}

/// Writes `sequences` as `<shard>.<count>.<split>.jsonl` files of at most `per_shard` records.
pub fn write_jsonl_shards(
    folder: &Path,
    split: &str,
    sequences: &[String],
    per_shard: usize,
) -> TrainingResult<Vec<PathBuf>> {
    if per_shard == 0 {
        return Err(TrainingError::Configuration("per_shard must be >= 1".to_string()));
    }
    std::fs::create_dir_all(folder)?;

    let mut paths = Vec::new();
    for (index, chunk) in sequences.chunks(per_shard).enumerate() {
        let mut out = String::new();
        for sequence in chunk {
            let record = SequenceRecord { sequence: sequence.clone(), metadata: serde_json::Value::Null };
            out.push_str(&serde_json::to_string(&record)?);
            out.push('\n');
        }
        let path = folder.join(format!("{index}.{}.{split}.jsonl", chunk.len()));
        std::fs::write(&path, out)?;
        paths.push(path);
    }
    Ok(paths)
}
