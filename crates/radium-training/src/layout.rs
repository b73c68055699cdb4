use std::path::{Path, PathBuf};

const ENTRY_PREFIX: &str = "checkpoint-";
const ENTRY_SUFFIX: &str = ".json";
const TEMP_SUFFIX: &str = ".tmp";

/// File naming inside a checkpoint directory.
///
/// Entries are `checkpoint-<index>.json` with a zero-padded, monotonically
/// increasing index; in-flight writes use a hidden `.checkpoint-<index>.json.tmp`.
#[derive(Debug, Clone)]
pub struct CheckpointLayout {
    root: PathBuf,
}

/// What a directory entry name means to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryName {
    Checkpoint(u64),
    Temp(u64),
}

impl CheckpointLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn entry_path(&self, index: u64) -> PathBuf {
        self.root.join(format!("{ENTRY_PREFIX}{index:012}{ENTRY_SUFFIX}"))
    }

    #[must_use]
    pub fn temp_path(&self, index: u64) -> PathBuf {
        self.root.join(format!(".{ENTRY_PREFIX}{index:012}{ENTRY_SUFFIX}{TEMP_SUFFIX}"))
    }

    #[must_use]
    pub fn classify(file_name: &str) -> Option<EntryName> {
        if let Some(rest) = file_name.strip_prefix('.') {
            let stem = rest.strip_suffix(TEMP_SUFFIX)?;
            return parse_index(stem).map(EntryName::Temp);
        }
        parse_index(file_name).map(EntryName::Checkpoint)
    }
}

fn parse_index(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(ENTRY_PREFIX)?.strip_suffix(ENTRY_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
