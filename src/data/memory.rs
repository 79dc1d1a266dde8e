/// In-memory chunk source
use ndarray::Axis;

use super::source::{
    check_chunk_size, chunk_ranges, permute, ChunkIter, ChunkSize, ChunkSource,
    DEFAULT_CHUNK_SIZE,
};
use crate::utils::Array;
use crate::{EvalError, Result};

/// Records held in one array, axis 0 being the record axis.
///
/// Shuffling only rewrites an index list; chunks are gathered with `select`, so
/// every chunk is a fresh allocation.
#[derive(Debug, Clone)]
pub struct InMemorySource {
    name: String,
    data: Array,
    shape: Vec<usize>,
    order: Vec<usize>,
    chunk_size: usize,
    default_chunk_size: ChunkSize,
    shuffleable: bool,
}

impl InMemorySource {
    /// Create a source named `name` over `data`
    pub fn new(name: impl Into<String>, data: Array) -> Result<Self> {
        let name = name.into();
        if data.ndim() == 0 {
            return Err(EvalError::Shape(format!(
                "source '{}' needs at least one (record) axis",
                name
            )));
        }

        let shape = data.shape()[1..].to_vec();
        let order = (0..data.len_of(Axis(0))).collect();

        Ok(Self {
            name,
            data,
            shape,
            order,
            chunk_size: DEFAULT_CHUNK_SIZE,
            default_chunk_size: ChunkSize::UseBatchSize,
            shuffleable: true,
        })
    }

    /// Ask for a fixed chunk size instead of following the batch size
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Result<Self> {
        self.chunk_size = check_chunk_size(chunk_size)?;
        self.default_chunk_size = ChunkSize::Fixed(chunk_size);
        Ok(self)
    }

    /// Declare the record order as meaningful; `shuffle` will then fail
    pub fn fixed_order(mut self) -> Self {
        self.shuffleable = false;
        self
    }

    /// Current record order as indices into the original data
    pub fn order(&self) -> &[usize] {
        &self.order
    }
}

impl ChunkSource for InMemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_chunk_size(&self) -> ChunkSize {
        self.default_chunk_size
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn set_chunk_size(&mut self, chunk_size: usize) -> Result<()> {
        self.chunk_size = check_chunk_size(chunk_size)?;
        Ok(())
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn can_shuffle(&self) -> bool {
        self.shuffleable
    }

    fn shuffle(&mut self, permutation: &[usize]) -> Result<()> {
        if !self.shuffleable {
            return Err(EvalError::ShuffleUnsupported(self.name.clone()));
        }
        self.order = permute(&self.order, permutation)?;
        Ok(())
    }

    fn iter(&self) -> ChunkIter<'_> {
        Box::new(
            chunk_ranges(self.order.len(), self.chunk_size)
                .map(move |range| Ok(self.data.select(Axis(0), &self.order[range]))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, ArrayD, IxDyn};

    fn five_records() -> InMemorySource {
        let data = ArrayD::from_shape_vec(IxDyn(&[5, 1]), vec![0.0f32, 1.0, 2.0, 3.0, 4.0])
            .unwrap();
        InMemorySource::new("x", data).unwrap().with_chunk_size(2).unwrap()
    }

    fn flatten(source: &InMemorySource) -> Result<Vec<f32>> {
        let mut values = Vec::new();
        for chunk in source.iter() {
            values.extend(chunk?.iter().copied());
        }
        Ok(values)
    }

    #[test]
    fn test_chunks_with_short_tail() -> Result<()> {
        let source = five_records();
        assert_eq!(source.len(), 5);
        assert_eq!(source.shape(), &[1]);
        assert_eq!(source.default_chunk_size(), ChunkSize::Fixed(2));

        let chunks: Vec<Array> = source.iter().collect::<Result<_>>()?;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], array![[0.0f32], [1.0]].into_dyn());
        assert_eq!(chunks[1], array![[2.0f32], [3.0]].into_dyn());
        assert_eq!(chunks[2], array![[4.0f32]].into_dyn());
        Ok(())
    }

    #[test]
    fn test_iteration_is_restartable() -> Result<()> {
        let source = five_records();
        let first = flatten(&source)?;
        let second = flatten(&source)?;
        assert_eq!(first, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_shuffle_reorders_records() -> Result<()> {
        let mut source = five_records();
        source.shuffle(&[4, 2, 0, 1, 3])?;
        assert_eq!(flatten(&source)?, vec![4.0, 2.0, 0.0, 1.0, 3.0]);

        // a second shuffle permutes the current order, not the original one
        source.shuffle(&[1, 0, 2, 3, 4])?;
        assert_eq!(flatten(&source)?, vec![2.0, 4.0, 0.0, 1.0, 3.0]);
        Ok(())
    }

    #[test]
    fn test_identity_shuffle_is_noop() -> Result<()> {
        let mut source = five_records();
        source.shuffle(&[0, 1, 2, 3, 4])?;
        assert_eq!(flatten(&source)?, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        Ok(())
    }

    #[test]
    fn test_invalid_permutation_leaves_order() -> Result<()> {
        let mut source = five_records();
        assert!(matches!(
            source.shuffle(&[0, 1, 2]),
            Err(EvalError::InvalidPermutation(_))
        ));
        assert!(matches!(
            source.shuffle(&[0, 1, 1, 2, 3]),
            Err(EvalError::InvalidPermutation(_))
        ));
        assert_eq!(source.order(), &[0, 1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn test_fixed_order_rejects_shuffle() {
        let mut source = five_records().fixed_order();
        assert!(!source.can_shuffle());
        assert!(matches!(
            source.shuffle(&[0, 1, 2, 3, 4]),
            Err(EvalError::ShuffleUnsupported(name)) if name == "x"
        ));
    }

    #[test]
    fn test_chunks_do_not_alias_source() -> Result<()> {
        let source = five_records();
        let mut chunk = source.iter().next().unwrap()?;
        chunk.fill(-1.0);
        assert_eq!(flatten(&source)?[0], 0.0);
        Ok(())
    }

    #[test]
    fn test_scalar_data_rejected() {
        let scalar = ArrayD::from_elem(IxDyn(&[]), 1.0f32);
        assert!(InMemorySource::new("x", scalar).is_err());
    }
}
