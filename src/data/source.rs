/// Chunked record sources
///
/// A source produces the records of exactly one named field, `chunk_size`
/// records at a time.
use std::ops::Range;

use crate::utils::Array;
use crate::{EvalError, Result};

/// Chunk size used until a provider negotiates one
pub const DEFAULT_CHUNK_SIZE: usize = 32;

/// Lazy sequence of freshly allocated chunks
pub type ChunkIter<'a> = Box<dyn Iterator<Item = Result<Array>> + 'a>;

/// The chunk size a source asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSize {
    /// Always read this many records per chunk
    Fixed(usize),
    /// Follow the batch size of whoever iterates the source
    UseBatchSize,
}

/// Ordered, optionally shuffleable producer of fixed-shape records.
///
/// Implementations must uphold:
/// - `len()` and `shape()` stay fixed for a pass
/// - every call to `iter()` starts a new pass at record 0, in the current order
/// - each chunk has shape `(k,) + shape()` with `1 <= k <= chunk_size()`, and only
///   the last chunk of a pass may be short
/// - `shuffle` validates the whole permutation before reordering anything
///
/// Shuffling while a pass is in flight is ruled out by the borrow checker:
/// `iter` holds `&self` until the pass is dropped.
pub trait ChunkSource {
    /// Field name this source reads
    fn name(&self) -> &str;

    /// Chunk size this kind of source would like to use
    fn default_chunk_size(&self) -> ChunkSize {
        ChunkSize::UseBatchSize
    }

    /// Effective chunk size
    fn chunk_size(&self) -> usize;

    /// Change the effective chunk size; zero is rejected
    fn set_chunk_size(&mut self, chunk_size: usize) -> Result<()>;

    /// Per-record dimensions, without the record axis
    fn shape(&self) -> &[usize];

    /// Total records in one pass
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `shuffle` is supported
    fn can_shuffle(&self) -> bool;

    /// Reorder records so that the next pass yields `current[p[0]], current[p[1]], ...`.
    ///
    /// Fails with `InvalidPermutation` when `permutation` is not a permutation of
    /// `0..len()`, and with `ShuffleUnsupported` when `can_shuffle()` is false.
    fn shuffle(&mut self, permutation: &[usize]) -> Result<()>;

    /// Start a new pass
    fn iter(&self) -> ChunkIter<'_>;
}

/// Reject chunk sizes that could never make progress
pub fn check_chunk_size(chunk_size: usize) -> Result<usize> {
    if chunk_size == 0 {
        return Err(EvalError::Config("chunk_size must be > 0".to_string()));
    }
    Ok(chunk_size)
}

/// Check that `permutation` is a permutation of `0..len`
pub fn validate_permutation(permutation: &[usize], len: usize) -> Result<()> {
    if permutation.len() != len {
        return Err(EvalError::InvalidPermutation(format!(
            "expected {} indices, got {}",
            len,
            permutation.len()
        )));
    }

    let mut seen = vec![false; len];
    for &index in permutation {
        match seen.get_mut(index) {
            None => {
                return Err(EvalError::InvalidPermutation(format!(
                    "index {} out of range for {} records",
                    index, len
                )))
            }
            Some(true) => {
                return Err(EvalError::InvalidPermutation(format!(
                    "index {} appears more than once",
                    index
                )))
            }
            Some(slot) => *slot = true,
        }
    }

    Ok(())
}

/// Reorder `items` by `permutation`, validating first
pub fn permute<T: Clone>(items: &[T], permutation: &[usize]) -> Result<Vec<T>> {
    validate_permutation(permutation, items.len())?;
    Ok(permutation.iter().map(|&i| items[i].clone()).collect())
}

/// Record ranges covered by each chunk of a pass
pub fn chunk_ranges(len: usize, chunk_size: usize) -> impl Iterator<Item = Range<usize>> {
    let step = chunk_size.max(1);
    (0..len)
        .step_by(step)
        .map(move |start| start..(start + step).min(len))
}
