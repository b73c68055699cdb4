//! Training checkpoints.
//!
//! A [`CheckpointStore`] owns one directory of numbered entries. Saving is
//! atomic from a reader's point of view (temp file, fsync, rename) and keeps at
//! most `keep_n` entries, evicting the oldest first.
//!
//! # Example
//!
//! ```rust,no_run
//! use radium_training::checkpoint::CheckpointStore;
//!
//! # fn main() -> radium_training::TrainingResult<()> {
//! let store = CheckpointStore::new("./ckpts");
//! if let Some(state) = store.get_last::<serde_json::Value>()? {
//!     println!("resuming at sequence {}", state.next_seq_index);
//!     store.save(&state, 5)?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod format;
mod store;

pub use store::{CheckpointEntry, CheckpointStore};
