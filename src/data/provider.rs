/// Providers: align named sources into batches
use ndarray::{Axis, Slice};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::source::{ChunkIter, ChunkSize, ChunkSource};
use crate::config::EvalConfig;
use crate::utils::{concatenate_rows, Array, Batch};
use crate::{EvalError, Result};

/// Lazy sequence of batches for one pass
pub type BatchIter<'a> = Box<dyn Iterator<Item = Result<Batch>> + 'a>;

/// Something that yields aligned batches.
///
/// Every array in a batch covers the same records, in the same order.
pub trait Provider {
    /// Total records in one pass, or `None` when that cannot be known upfront
    fn len(&self) -> Option<usize>;

    /// Add (or replace) a named source
    fn add_source(&mut self, name: &str, source: Box<dyn ChunkSource>) -> Result<()>;

    /// Names of every source, in batch key order
    fn source_names(&self) -> Vec<String>;

    /// Per-record shape of a source
    fn source_shape(&self, name: &str) -> Option<Vec<usize>>;

    /// Start a new pass
    fn batches(&mut self) -> Result<BatchIter<'_>>;
}

/// Re-slices a source's chunks into pieces of any requested size
struct RowBuffer<'a> {
    chunks: ChunkIter<'a>,
    pending: Option<Array>,
    offset: usize,
}

impl<'a> RowBuffer<'a> {
    fn new(chunks: ChunkIter<'a>) -> Self {
        Self {
            chunks,
            pending: None,
            offset: 0,
        }
    }

    /// Take up to `n` rows; `None` once the source is drained
    fn take(&mut self, n: usize) -> Result<Option<Array>> {
        let mut pieces = Vec::new();
        let mut needed = n;

        while needed > 0 {
            let available = match &self.pending {
                Some(chunk) => chunk.len_of(Axis(0)) - self.offset,
                None => 0,
            };

            if available == 0 {
                match self.chunks.next() {
                    Some(chunk) => {
                        self.pending = Some(chunk?);
                        self.offset = 0;
                        continue;
                    }
                    None => {
                        self.pending = None;
                        break;
                    }
                }
            }

            let rows = available.min(needed);
            if self.offset == 0 && rows == available {
                // whole chunk, no copy
                if let Some(chunk) = self.pending.take() {
                    pieces.push(chunk);
                }
            } else if let Some(chunk) = &self.pending {
                let slice = Slice::from(self.offset..self.offset + rows);
                pieces.push(chunk.slice_axis(Axis(0), slice).to_owned());
                self.offset += rows;
            }
            needed -= rows;
        }

        match pieces.len() {
            0 => Ok(None),
            1 => Ok(pieces.pop()),
            _ => concatenate_rows(&pieces).map(Some),
        }
    }
}

/// Walks every source in lockstep
struct AlignedBatches<'a> {
    streams: Vec<(String, RowBuffer<'a>)>,
    batch_size: usize,
    remaining: Option<usize>,
    done: bool,
}

impl AlignedBatches<'_> {
    fn next_batch(&mut self) -> Result<Option<Batch>> {
        let mut pieces = Vec::with_capacity(self.streams.len());
        for (name, stream) in &mut self.streams {
            match stream.take(self.batch_size)? {
                Some(rows) => pieces.push((name.clone(), rows)),
                None => return Ok(None),
            }
        }

        // A shorter source ends the pass; trim the others to match
        let rows = pieces
            .iter()
            .map(|(_, a)| a.len_of(Axis(0)))
            .min()
            .unwrap_or(0);

        let mut batch = Batch::with_capacity(pieces.len());
        for (name, array) in pieces {
            let array = if array.len_of(Axis(0)) > rows {
                self.done = true;
                array.slice_axis(Axis(0), Slice::from(0..rows)).to_owned()
            } else {
                array
            };
            batch.insert(name, array);
        }

        Ok(Some(batch))
    }
}

impl Iterator for AlignedBatches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.streams.is_empty() || self.remaining == Some(0) {
            return None;
        }

        match self.next_batch() {
            Ok(Some(batch)) => {
                if let Some(remaining) = self.remaining.as_mut() {
                    *remaining -= 1;
                }
                Some(Ok(batch))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Provider over a set of owned sources
pub struct BatchProvider {
    sources: Vec<(String, Box<dyn ChunkSource>)>,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
    num_batches: Option<usize>,
    known_length: bool,
}

impl BatchProvider {
    /// Create a provider yielding batches of `batch_size` records
    pub fn new(sources: Vec<(String, Box<dyn ChunkSource>)>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(EvalError::Config("batch_size must be > 0".to_string()));
        }

        Ok(Self {
            sources,
            batch_size,
            shuffle: false,
            rng: StdRng::from_entropy(),
            num_batches: None,
            known_length: true,
        })
    }

    /// Create a provider from run settings
    pub fn from_config(
        sources: Vec<(String, Box<dyn ChunkSource>)>,
        config: &EvalConfig,
    ) -> Result<Self> {
        config.validate()?;
        let mut provider = Self::new(sources, config.batch_size)?;
        if config.shuffle {
            provider = provider.with_shuffle(config.seed);
        }
        if let Some(n) = config.num_batches {
            provider = provider.with_num_batches(n);
        }
        Ok(provider)
    }

    /// Shuffle all sources with one shared permutation before every pass
    pub fn with_shuffle(mut self, seed: Option<u64>) -> Self {
        self.shuffle = true;
        if let Some(seed) = seed {
            self.rng = StdRng::seed_from_u64(seed);
        }
        self
    }

    /// Stop every pass after `num_batches` batches
    pub fn with_num_batches(mut self, num_batches: usize) -> Self {
        self.num_batches = Some(num_batches);
        self
    }

    /// Report an indeterminate length, as a streaming provider would
    pub fn with_unknown_length(mut self) -> Self {
        self.known_length = false;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Apply one random permutation to every source, or to none of them
    fn shuffle_sources(&mut self) -> Result<()> {
        let Some((_, first)) = self.sources.first() else {
            return Ok(());
        };
        let n = first.len();

        for (name, source) in &self.sources {
            if !source.can_shuffle() {
                return Err(EvalError::ShuffleUnsupported(name.clone()));
            }
            if source.len() != n {
                return Err(EvalError::InvalidPermutation(format!(
                    "cannot shuffle '{}' ({} records) together with {} records",
                    name,
                    source.len(),
                    n
                )));
            }
        }

        let mut permutation: Vec<usize> = (0..n).collect();
        permutation.shuffle(&mut self.rng);

        for (_, source) in &mut self.sources {
            source.shuffle(&permutation)?;
        }

        log::debug!("Shuffled {} sources of {} records", self.sources.len(), n);
        Ok(())
    }

    /// `UseBatchSize` sources follow the batch size, the rest keep their own
    fn negotiate_chunk_sizes(&mut self) -> Result<()> {
        for (_, source) in &mut self.sources {
            let chunk_size = match source.default_chunk_size() {
                ChunkSize::UseBatchSize => self.batch_size,
                ChunkSize::Fixed(n) => n,
            };
            source.set_chunk_size(chunk_size)?;
        }
        Ok(())
    }
}

impl Provider for BatchProvider {
    fn len(&self) -> Option<usize> {
        if !self.known_length {
            return None;
        }

        let records = self.sources.iter().map(|(_, s)| s.len()).min()?;
        Some(match self.num_batches {
            Some(n) => records.min(n * self.batch_size),
            None => records,
        })
    }

    fn add_source(&mut self, name: &str, source: Box<dyn ChunkSource>) -> Result<()> {
        match self.sources.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => {
                log::debug!("Replacing source '{}'", name);
                slot.1 = source;
            }
            None => self.sources.push((name.to_string(), source)),
        }
        Ok(())
    }

    fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|(n, _)| n.clone()).collect()
    }

    fn source_shape(&self, name: &str) -> Option<Vec<usize>> {
        self.sources
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s.shape().to_vec())
    }

    fn batches(&mut self) -> Result<BatchIter<'_>> {
        if self.shuffle {
            self.shuffle_sources()?;
        }
        self.negotiate_chunk_sizes()?;

        let streams = self
            .sources
            .iter()
            .map(|(name, source)| (name.clone(), RowBuffer::new(source.iter())))
            .collect();

        Ok(Box::new(AlignedBatches {
            streams,
            batch_size: self.batch_size,
            remaining: self.num_batches,
            done: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::npz::tests::write_records;
    use crate::data::{InMemorySource, NpzRecordSource};
    use ndarray::{ArrayD, IxDyn};

    fn column(name: &str, values: &[f32]) -> Box<dyn ChunkSource> {
        let data = ArrayD::from_shape_vec(IxDyn(&[values.len(), 1]), values.to_vec()).unwrap();
        Box::new(InMemorySource::new(name, data).unwrap())
    }

    fn fixed_column(name: &str, values: &[f32], chunk_size: usize) -> Box<dyn ChunkSource> {
        let data = ArrayD::from_shape_vec(IxDyn(&[values.len(), 1]), values.to_vec()).unwrap();
        Box::new(
            InMemorySource::new(name, data)
                .unwrap()
                .with_chunk_size(chunk_size)
                .unwrap(),
        )
    }

    fn values(batch: &Batch, key: &str) -> Vec<f32> {
        batch[key].iter().copied().collect()
    }

    #[test]
    fn test_batches_are_aligned() -> Result<()> {
        let sources = vec![
            ("x".to_string(), column("x", &[0.0, 1.0, 2.0, 3.0, 4.0])),
            ("y".to_string(), column("y", &[10.0, 11.0, 12.0, 13.0, 14.0])),
        ];
        let mut provider = BatchProvider::new(sources, 2)?;
        assert_eq!(provider.len(), Some(5));

        let batches: Vec<Batch> = provider.batches()?.collect::<Result<_>>()?;
        assert_eq!(batches.len(), 3);
        assert_eq!(values(&batches[0], "x"), vec![0.0, 1.0]);
        assert_eq!(values(&batches[0], "y"), vec![10.0, 11.0]);
        assert_eq!(values(&batches[2], "x"), vec![4.0]);
        assert_eq!(values(&batches[2], "y"), vec![14.0]);
        Ok(())
    }

    #[test]
    fn test_rechunks_fixed_sources() -> Result<()> {
        let sources = vec![
            ("x".to_string(), fixed_column("x", &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 3)),
            ("y".to_string(), fixed_column("y", &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2)),
        ];
        let mut provider = BatchProvider::new(sources, 4)?;

        let batches: Vec<Batch> = provider.batches()?.collect::<Result<_>>()?;
        assert_eq!(batches.len(), 2);
        assert_eq!(values(&batches[0], "x"), vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(values(&batches[0], "y"), vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(values(&batches[1], "x"), vec![4.0, 5.0, 6.0]);
        assert_eq!(values(&batches[1], "y"), vec![4.0, 5.0, 6.0]);
        Ok(())
    }

    #[test]
    fn test_shorter_source_ends_pass() -> Result<()> {
        let sources = vec![
            ("x".to_string(), column("x", &[0.0, 1.0, 2.0, 3.0, 4.0])),
            ("y".to_string(), column("y", &[0.0, 1.0, 2.0])),
        ];
        let mut provider = BatchProvider::new(sources, 2)?;
        assert_eq!(provider.len(), Some(3));

        let batches: Vec<Batch> = provider.batches()?.collect::<Result<_>>()?;
        assert_eq!(batches.len(), 2);
        assert_eq!(values(&batches[1], "x"), vec![2.0]);
        assert_eq!(values(&batches[1], "y"), vec![2.0]);
        Ok(())
    }

    #[test]
    fn test_num_batches_limit() -> Result<()> {
        let sources = vec![("x".to_string(), column("x", &[0.0, 1.0, 2.0, 3.0, 4.0]))];
        let mut provider = BatchProvider::new(sources, 2)?.with_num_batches(2);
        assert_eq!(provider.len(), Some(4));
        assert_eq!(provider.batches()?.count(), 2);
        Ok(())
    }

    #[test]
    fn test_unknown_length() -> Result<()> {
        let sources = vec![("x".to_string(), column("x", &[0.0, 1.0, 2.0]))];
        let mut provider = BatchProvider::new(sources, 2)?.with_unknown_length();
        assert_eq!(provider.len(), None);
        assert_eq!(provider.batches()?.count(), 2);
        Ok(())
    }

    #[test]
    fn test_shuffle_keeps_sources_aligned() -> Result<()> {
        let xs: Vec<f32> = (0..20).map(|i| i as f32).collect();
        let ys: Vec<f32> = xs.iter().map(|x| x * 100.0).collect();
        let sources = vec![
            ("x".to_string(), column("x", &xs)),
            ("y".to_string(), column("y", &ys)),
        ];
        let mut provider = BatchProvider::new(sources, 6)?.with_shuffle(Some(7));

        let mut seen = Vec::new();
        for batch in provider.batches()? {
            let batch = batch?;
            let x = values(&batch, "x");
            let y = values(&batch, "y");
            for (a, b) in x.iter().zip(&y) {
                assert_eq!(a * 100.0, *b);
            }
            seen.extend(x);
        }

        assert_ne!(seen, xs);
        seen.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(seen, xs);
        Ok(())
    }

    #[test]
    fn test_shuffle_requires_capable_sources() -> Result<()> {
        let data = ArrayD::from_shape_vec(IxDyn(&[2, 1]), vec![0.0f32, 1.0]).unwrap();
        let fixed = InMemorySource::new("t", data).unwrap().fixed_order();
        let sources: Vec<(String, Box<dyn ChunkSource>)> = vec![
            ("x".to_string(), column("x", &[0.0, 1.0])),
            ("t".to_string(), Box::new(fixed)),
        ];
        let mut provider = BatchProvider::new(sources, 2)?.with_shuffle(Some(1));

        assert!(matches!(
            provider.batches().err(),
            Some(EvalError::ShuffleUnsupported(name)) if name == "t"
        ));
        Ok(())
    }

    #[test]
    fn test_shuffle_requires_equal_lengths() -> Result<()> {
        let sources = vec![
            ("x".to_string(), column("x", &[0.0, 1.0, 2.0, 3.0, 4.0])),
            ("y".to_string(), column("y", &[0.0, 1.0, 2.0])),
        ];
        let mut provider = BatchProvider::new(sources, 2)?.with_shuffle(Some(3));

        assert!(matches!(
            provider.batches().err(),
            Some(EvalError::InvalidPermutation(_))
        ));

        // the check runs before any source is reordered
        let x: Vec<f32> = provider.sources[0]
            .1
            .iter()
            .collect::<Result<Vec<_>>>()?
            .iter()
            .flat_map(|chunk| chunk.iter().copied())
            .collect();
        assert_eq!(x, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        Ok(())
    }

    #[test]
    fn test_failing_chunk_ends_pass() -> Result<()> {
        let dir = std::env::temp_dir()
            .join(format!("streameval_provider_missing_{}", std::process::id()));
        let fnames = write_records(&dir, 5);
        std::fs::remove_file(&fnames[3])?;

        let x: Box<dyn ChunkSource> = Box::new(NpzRecordSource::with_shape("x", fnames, vec![2]));
        let mut provider = BatchProvider::new(vec![("x".to_string(), x)], 2)?;
        let outcomes: Vec<Result<Batch>> = provider.batches()?.collect();
        std::fs::remove_dir_all(&dir).ok();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].is_ok());
        assert!(matches!(outcomes[1], Err(EvalError::Io(_))));
        Ok(())
    }

    #[test]
    fn test_add_source_replaces() -> Result<()> {
        let sources = vec![("x".to_string(), column("x", &[0.0, 1.0]))];
        let mut provider = BatchProvider::new(sources, 2)?;
        provider.add_source("x", column("x", &[5.0, 6.0, 7.0]))?;
        provider.add_source("w", column("w", &[1.0, 1.0, 1.0]))?;

        assert_eq!(provider.source_names(), vec!["x".to_string(), "w".to_string()]);
        assert_eq!(provider.source_shape("w"), Some(vec![1]));
        assert_eq!(provider.source_shape("nope"), None);
        assert_eq!(provider.len(), Some(3));
        Ok(())
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(BatchProvider::new(Vec::new(), 0).is_err());
    }
}
