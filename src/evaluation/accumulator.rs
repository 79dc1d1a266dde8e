/// Result accumulators
///
/// A pass merges per-batch arrays into whole-dataset arrays in one of two
/// ways, picked once per pass by `accumulator_for`:
/// - `GrowingAccumulator` when the total record count is unknown: keep every
///   batch's arrays and concatenate them at the end.
/// - `PreallocatedAccumulator` when the total is known: allocate the final
///   arrays on the first batch and copy each batch straight into its slot.
use ndarray::{ArrayD, Axis, IxDyn, Slice};

use crate::utils::{concatenate_rows, leading_dim, row_shape, Array, Outputs};
use crate::{EvalError, Result};

/// One batch's arrays, keyed by output name
pub type Rows = Vec<(String, Array)>;

/// Merges per-batch arrays into one array per key
pub trait ResultAccumulator {
    /// Set up storage from the first batch; fixes the key set and row shapes
    fn initialize(&mut self, first: &[(String, Array)]) -> Result<()>;

    /// Merge one batch whose first record is record `offset` of the pass.
    /// The arrays are moved in; nothing is copied until finalize.
    fn absorb(&mut self, offset: usize, rows: Rows) -> Result<()>;

    /// Produce the whole-dataset arrays
    fn finalize(self: Box<Self>) -> Result<Outputs>;
}

/// Pick the strategy for a pass of `total` records
pub fn accumulator_for(total: Option<usize>) -> Box<dyn ResultAccumulator> {
    match total {
        Some(total) => Box::new(PreallocatedAccumulator::new(total)),
        None => Box::new(GrowingAccumulator::default()),
    }
}

/// Key set and row shape recorded from the first batch
#[derive(Debug, Default)]
struct Layout {
    keys: Vec<(String, Vec<usize>)>,
}

impl Layout {
    fn from_rows(rows: &[(String, Array)]) -> Self {
        Self {
            keys: rows
                .iter()
                .map(|(k, v)| (k.clone(), row_shape(v).to_vec()))
                .collect(),
        }
    }

    /// Position of every key of `rows` in the layout, checking row shapes
    fn match_rows(&self, rows: &[(String, Array)]) -> Result<Vec<usize>> {
        if rows.len() != self.keys.len() {
            return Err(EvalError::Shape(format!(
                "batch has {} outputs, the first batch had {}",
                rows.len(),
                self.keys.len()
            )));
        }

        rows.iter()
            .map(|(key, value)| {
                let index = self
                    .keys
                    .iter()
                    .position(|(k, _)| k == key)
                    .ok_or_else(|| {
                        EvalError::Shape(format!("output '{}' was not in the first batch", key))
                    })?;

                let expected = &self.keys[index].1;
                if row_shape(value) != expected.as_slice() {
                    return Err(EvalError::Shape(format!(
                        "output '{}' has rows of shape {:?}, expected {:?}",
                        key,
                        row_shape(value),
                        expected
                    )));
                }
                Ok(index)
            })
            .collect()
    }

    fn empty_array(&self, index: usize, records: usize) -> Array {
        let mut dims = vec![records];
        dims.extend_from_slice(&self.keys[index].1);
        ArrayD::zeros(IxDyn(&dims))
    }
}

/// Unknown total: collect chunks, concatenate at the end
#[derive(Debug, Default)]
pub struct GrowingAccumulator {
    layout: Layout,
    chunks: Vec<Vec<Array>>,
    records: usize,
}

impl ResultAccumulator for GrowingAccumulator {
    fn initialize(&mut self, first: &[(String, Array)]) -> Result<()> {
        self.layout = Layout::from_rows(first);
        self.chunks = vec![Vec::new(); first.len()];
        Ok(())
    }

    fn absorb(&mut self, _offset: usize, rows: Rows) -> Result<()> {
        let indices = self.layout.match_rows(&rows)?;
        if let Some((_, value)) = rows.first() {
            self.records += leading_dim(value)?;
        }
        for (index, (_, value)) in indices.into_iter().zip(rows) {
            self.chunks[index].push(value);
        }
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<Outputs> {
        let Self {
            layout,
            chunks,
            records,
        } = *self;
        log::debug!("Concatenating {} records per output", records);

        let mut outputs = Outputs::with_capacity(chunks.len());
        for (index, pieces) in chunks.into_iter().enumerate() {
            let array = if pieces.is_empty() {
                layout.empty_array(index, 0)
            } else {
                concatenate_rows(&pieces)?
            };
            outputs.insert(layout.keys[index].0.clone(), array);
        }
        Ok(outputs)
    }
}

/// Known total: write each batch into preallocated arrays
#[derive(Debug)]
pub struct PreallocatedAccumulator {
    total: usize,
    layout: Layout,
    arrays: Vec<Array>,
    filled: usize,
}

impl PreallocatedAccumulator {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            layout: Layout::default(),
            arrays: Vec::new(),
            filled: 0,
        }
    }
}

impl ResultAccumulator for PreallocatedAccumulator {
    fn initialize(&mut self, first: &[(String, Array)]) -> Result<()> {
        self.layout = Layout::from_rows(first);
        self.arrays = (0..first.len())
            .map(|i| self.layout.empty_array(i, self.total))
            .collect();
        Ok(())
    }

    fn absorb(&mut self, offset: usize, rows: Rows) -> Result<()> {
        let indices = self.layout.match_rows(&rows)?;

        for (index, (key, value)) in indices.into_iter().zip(rows) {
            let n = leading_dim(&value)?;
            let end = offset + n;
            if end > self.total {
                return Err(EvalError::Shape(format!(
                    "provider announced {} records but '{}' reaches record {}",
                    self.total, key, end
                )));
            }

            self.arrays[index]
                .slice_axis_mut(Axis(0), Slice::from(offset..end))
                .assign(&value);
            self.filled = self.filled.max(end);
        }
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<Outputs> {
        let Self {
            total,
            layout,
            arrays,
            filled,
        } = *self;

        if filled != total {
            return Err(EvalError::Shape(format!(
                "provider announced {} records but yielded {}",
                total, filled
            )));
        }

        Ok(layout
            .keys
            .into_iter()
            .map(|(key, _)| key)
            .zip(arrays)
            .collect())
    }
}
