//! Batched iteration over a [`SequenceSource`] that can start at any offset.

use crate::dataset::SequenceSource;
use crate::error::{TrainingError, TrainingResult};
use crate::model::Batch;

/// Token used to right-pad sequences shorter than `seq_len`.
pub const PAD_TOKEN: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IteratorOptions {
    pub seq_len: usize,
    pub batch_size: usize,
    /// Leading items to discard; a global offset, so it may exceed one cycle.
    pub skip: u64,
    /// Wrap around forever instead of stopping after one cycle.
    pub looping: bool,
}

/// Produces fixed-size batches starting `skip` items into a source.
///
/// Item `i` of the stream is position `i % total` of cycle `i / total`. Without
/// looping the stream ends after the first cycle and the last batch may be short.
/// The only way to rewind is to build a new iterator.
#[derive(Debug)]
pub struct ResumableSequenceIterator<S> {
    source: S,
    total: u64,
    seq_len: usize,
    batch_size: usize,
    position: u64,
    looping: bool,
}

impl<S: SequenceSource> ResumableSequenceIterator<S> {
    pub fn new(source: S, options: IteratorOptions) -> TrainingResult<Self> {
        let total = source.count() as u64;
        if total == 0 {
            return Err(TrainingError::Configuration("no sequences found in data source".to_string()));
        }
        if options.batch_size == 0 {
            return Err(TrainingError::Configuration("batch_size must be >= 1".to_string()));
        }
        if options.seq_len == 0 {
            return Err(TrainingError::Configuration("seq_len must be >= 1".to_string()));
        }

        Ok(Self {
            source,
            total,
            seq_len: options.seq_len,
            batch_size: options.batch_size,
            position: options.skip,
            looping: options.looping,
        })
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Global offset of the next item to be yielded.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Batches left before exhaustion, or `None` when looping.
    #[must_use]
    pub fn remaining_batches(&self) -> Option<u64> {
        if self.looping {
            return None;
        }
        Some(self.total.saturating_sub(self.position).div_ceil(self.batch_size as u64))
    }

    pub fn next_batch(&mut self) -> TrainingResult<Option<Batch>> {
        let end = if self.looping {
            self.position + self.batch_size as u64
        } else if self.position >= self.total {
            return Ok(None);
        } else {
            (self.position + self.batch_size as u64).min(self.total)
        };

        let mut batch = Vec::with_capacity(self.batch_size);
        for item in self.position..end {
            let cycle = item / self.total;
            let position = (item % self.total) as usize;
            let sequence = self.source.sequence(cycle, position)?;
            batch.push(frame(sequence, self.seq_len));
        }

        self.position = end;
        Ok(Some(batch))
    }
}

impl<S: SequenceSource> Iterator for ResumableSequenceIterator<S> {
    type Item = TrainingResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

fn frame(mut sequence: Vec<u8>, seq_len: usize) -> Vec<u8> {
    sequence.truncate(seq_len);
    sequence.resize(seq_len, PAD_TOKEN);
    sequence
}
