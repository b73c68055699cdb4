//! Directory-backed checkpoint store with atomic writes and count-based retention.

use super::format;
use crate::error::{TrainingError, TrainingResult};
use crate::layout::{CheckpointLayout, EntryName};
use crate::state::TrainingState;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A persisted checkpoint file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointEntry {
    pub index: u64,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    layout: CheckpointLayout,
}

impl CheckpointStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { layout: CheckpointLayout::new(root.into()) }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    /// Checkpoint entries in write order. A missing directory has no entries.
    pub fn list(&self) -> TrainingResult<Vec<CheckpointEntry>> {
        let mut entries: Vec<_> = self
            .scan()?
            .into_iter()
            .filter_map(|(name, path)| match name {
                EntryName::Checkpoint(index) => Some(CheckpointEntry { index, path }),
                EntryName::Temp(_) => None,
            })
            .collect();
        entries.sort_by_key(|e| e.index);
        Ok(entries)
    }

    /// Deletes every checkpoint after `confirm` approves the prompt.
    ///
    /// Declining returns `DestructiveActionDeclined` and leaves the directory untouched.
    pub fn reset(&self, confirm: impl FnOnce(&str) -> TrainingResult<bool>) -> TrainingResult<usize> {
        let prompt = format!(
            "are you sure you want to clear all checkpoints in {} and restart training?",
            self.root().display()
        );
        if !confirm(&prompt)? {
            return Err(TrainingError::DestructiveActionDeclined(format!(
                "checkpoints in {} were kept",
                self.root().display()
            )));
        }

        let mut removed = 0;
        for (name, path) in self.scan()? {
            fs::remove_file(&path).map_err(|e| TrainingError::storage(&path, e))?;
            if matches!(name, EntryName::Checkpoint(_)) {
                removed += 1;
            }
        }
        info!(removed, root = %self.root().display(), "cleared checkpoints");
        Ok(removed)
    }

    /// The newest checkpoint, or `None` when nothing has been saved yet.
    pub fn get_last<S: DeserializeOwned>(&self) -> TrainingResult<Option<TrainingState<S>>> {
        let Some(entry) = self.list()?.pop() else {
            return Ok(None);
        };

        let bytes = fs::read(&entry.path).map_err(|e| TrainingError::storage(&entry.path, e))?;
        let (header, state) = format::decode(&entry.path, &bytes)?;
        if header.index != entry.index {
            return Err(TrainingError::corruption(
                &entry.path,
                format!("header index {} does not match file name", header.index),
            ));
        }
        debug!(index = entry.index, path = %entry.path.display(), "loaded checkpoint");
        Ok(Some(state))
    }

    /// Writes `state` as the newest entry, then evicts the oldest until at most
    /// `keep_n` remain. `keep_n == 0` is rejected before anything is written.
    pub fn save<S: Serialize>(&self, state: &TrainingState<S>, keep_n: usize) -> TrainingResult<CheckpointEntry> {
        if keep_n == 0 {
            return Err(TrainingError::Configuration("checkpoint keep_n must be >= 1".to_string()));
        }

        let root = self.root();
        fs::create_dir_all(root).map_err(|e| TrainingError::storage(root, e))?;

        let scanned = self.scan()?;
        self.remove_stale_temps(&scanned);

        let index = scanned
            .iter()
            .filter_map(|(name, _)| match name {
                EntryName::Checkpoint(i) | EntryName::Temp(i) => Some(*i),
            })
            .max()
            .map_or(0, |i| i + 1);

        let bytes = format::encode(index, state)?;
        let temp = self.layout.temp_path(index);
        write_synced(&temp, &bytes).map_err(|e| TrainingError::storage(&temp, e))?;

        let path = self.layout.entry_path(index);
        fs::rename(&temp, &path).map_err(|e| TrainingError::storage(&path, e))?;
        sync_dir(root);

        info!(
            index,
            next_seq_index = state.next_seq_index,
            path = %path.display(),
            "saved checkpoint"
        );

        self.evict(keep_n)?;
        Ok(CheckpointEntry { index, path })
    }

    fn evict(&self, keep_n: usize) -> TrainingResult<()> {
        let entries = self.list()?;
        let excess = entries.len().saturating_sub(keep_n);
        for entry in entries.into_iter().take(excess) {
            fs::remove_file(&entry.path).map_err(|e| TrainingError::storage(&entry.path, e))?;
            debug!(index = entry.index, "evicted checkpoint");
        }
        Ok(())
    }

    fn remove_stale_temps(&self, scanned: &[(EntryName, PathBuf)]) {
        for (name, path) in scanned {
            if let EntryName::Temp(index) = name
                && let Err(e) = fs::remove_file(path)
            {
                warn!(index, path = %path.display(), error = %e, "failed to remove stale checkpoint temp file");
            }
        }
    }

    fn scan(&self) -> TrainingResult<Vec<(EntryName, PathBuf)>> {
        let root = self.root();
        let dir = match fs::read_dir(root) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TrainingError::storage(root, e)),
        };

        let mut out = Vec::new();
        for entry in dir {
            let entry = entry.map_err(|e| TrainingError::storage(root, e))?;
            let Some(name) = entry.file_name().to_str().and_then(CheckpointLayout::classify) else {
                continue;
            };
            out.push((name, entry.path()));
        }
        Ok(out)
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
        warn!(dir = %dir.display(), error = %e, "failed to sync checkpoint directory");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ModelConfig;
    use crate::tensor::{ParamTree, Tensor};
    use tempfile::TempDir;

    fn state(next_seq_index: u64) -> TrainingState<u64> {
        let mut params = ParamTree::new();
        params.insert("w", Tensor::new(vec![1], vec![next_seq_index as f32]).unwrap());
        TrainingState {
            model_config: ModelConfig::from_toml_str("seq_len = 8").unwrap(),
            params,
            optimizer_state: next_seq_index * 2,
            next_seq_index,
            step: next_seq_index / 16,
            run_id: None,
        }
    }

    #[test]
    fn test_get_last_on_empty_store_is_none() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path().join("missing"));
        assert!(store.get_last::<u64>().unwrap().is_none());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_save_then_get_last_returns_newest() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path());
        store.save(&state(16), 3).unwrap();
        store.save(&state(32), 3).unwrap();
        assert_eq!(store.get_last::<u64>().unwrap(), Some(state(32)));
    }

    #[test]
    fn test_float_model_config_values_reload_bit_identical() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path());
        let mut saved = state(16);
        for (key, value) in [("init_scale", 3.713_670_712_346_104_3e-32), ("dropout", 0.1), ("eps", 1e-308)] {
            saved.model_config.set(key, value);
        }
        store.save(&saved, 1).unwrap();

        let loaded = store.get_last::<u64>().unwrap().unwrap();
        for key in ["init_scale", "dropout", "eps"] {
            let before = saved.model_config.get(key).and_then(serde_json::Value::as_f64).unwrap();
            let after = loaded.model_config.get(key).and_then(serde_json::Value::as_f64).unwrap();
            assert_eq!(before.to_bits(), after.to_bits(), "{key}");
        }
        assert_eq!(loaded, saved);
    }

    #[test]
    fn test_retention_never_exceeds_keep_n() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path());
        for i in 1..=7 {
            store.save(&state(i * 16), 3).unwrap();
            assert!(store.list().unwrap().len() <= 3);
            assert_eq!(store.get_last::<u64>().unwrap().unwrap().next_seq_index, i * 16);
        }
        let indices: Vec<u64> = store.list().unwrap().iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![4, 5, 6]);
    }

    #[test]
    fn test_zero_keep_n_is_rejected_without_writing() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path());
        let err = store.save(&state(16), 0).unwrap_err();
        assert!(matches!(err, TrainingError::Configuration(_)));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_corrupted_newest_entry_is_not_masked() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path());
        let entry = store.save(&state(16), 3).unwrap();
        fs::write(&entry.path, b"{\"version\":1}\n{}").unwrap();

        let err = store.get_last::<u64>().unwrap_err();
        assert!(matches!(err, TrainingError::Corruption { .. }));
    }

    #[test]
    fn test_leftover_temp_file_is_ignored_and_cleaned() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path());
        store.save(&state(16), 3).unwrap();

        let stale = CheckpointLayout::new(temp.path().to_path_buf()).temp_path(7);
        fs::write(&stale, b"half a checkpo").unwrap();
        assert_eq!(store.get_last::<u64>().unwrap().unwrap().next_seq_index, 16);

        let entry = store.save(&state(32), 3).unwrap();
        assert!(!stale.exists());
        assert_eq!(entry.index, 8);
    }

    #[test]
    fn test_unwritable_location_is_storage_error() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("not-a-dir");
        fs::write(&blocker, b"file").unwrap();

        let store = CheckpointStore::new(blocker.join("ckpts"));
        let err = store.save(&state(16), 3).unwrap_err();
        assert!(matches!(err, TrainingError::Storage { .. }));
    }

    #[test]
    fn test_reset_declined_keeps_checkpoints() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path());
        store.save(&state(16), 3).unwrap();
        store.save(&state(32), 3).unwrap();

        let err = store.reset(|_| Ok(false)).unwrap_err();
        assert!(matches!(err, TrainingError::DestructiveActionDeclined(_)));
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn test_reset_confirmed_removes_only_checkpoints() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path());
        store.save(&state(16), 3).unwrap();
        store.save(&state(32), 3).unwrap();
        fs::write(temp.path().join("notes.txt"), b"keep me").unwrap();

        let removed = store.reset(|prompt| Ok(prompt.contains("clear all checkpoints"))).unwrap();
        assert_eq!(removed, 2);
        assert!(store.get_last::<u64>().unwrap().is_none());
        assert!(temp.path().join("notes.txt").exists());
    }
}
