/// File-backed source: one `.npz` archive per record
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use ndarray::{ArrayD, Axis, IxDyn};
use ndarray_npy::NpzReader;

use super::numpy_dataset::read_npz_field;
use super::source::{
    check_chunk_size, chunk_ranges, permute, ChunkIter, ChunkSize, ChunkSource,
    DEFAULT_CHUNK_SIZE,
};
use crate::utils::Array;
use crate::{EvalError, Result};

/// Reads one named field from an ordered list of record archives.
///
/// Every record is opened, read and closed on its own; nothing is cached
/// between chunks. Shuffling reorders the file list.
#[derive(Debug, Clone)]
pub struct NpzRecordSource {
    field: String,
    fnames: Vec<PathBuf>,
    shape: Vec<usize>,
    chunk_size: usize,
}

impl NpzRecordSource {
    /// Create a source for `field`, taking the record shape from the first file
    pub fn new(field: impl Into<String>, fnames: Vec<PathBuf>) -> Result<Self> {
        let field = field.into();
        let first = fnames.first().ok_or_else(|| {
            EvalError::Config(format!(
                "cannot infer the shape of '{}' without any record files",
                field
            ))
        })?;
        let shape = read_record(first, &field)?.shape().to_vec();

        Ok(Self::with_shape(field, fnames, shape))
    }

    /// Create a source with a known record shape
    pub fn with_shape(field: impl Into<String>, fnames: Vec<PathBuf>, shape: Vec<usize>) -> Self {
        Self {
            field: field.into(),
            fnames,
            shape,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Record files in current order
    pub fn fnames(&self) -> &[PathBuf] {
        &self.fnames
    }

    fn read_chunk(&self, fnames: &[PathBuf]) -> Result<Array> {
        let mut dims = Vec::with_capacity(self.shape.len() + 1);
        dims.push(fnames.len());
        dims.extend_from_slice(&self.shape);

        let mut out = ArrayD::<f32>::zeros(IxDyn(&dims));
        for (row, path) in fnames.iter().enumerate() {
            let record = read_record(path, &self.field)?;
            if record.shape() != self.shape.as_slice() {
                return Err(EvalError::Shape(format!(
                    "record {:?} has '{}' of shape {:?}, expected {:?}",
                    path,
                    self.field,
                    record.shape(),
                    self.shape
                )));
            }
            out.index_axis_mut(Axis(0), row).assign(&record);
        }

        Ok(out)
    }
}

/// Open `path`, read `field`, close the file
fn read_record(path: &Path, field: &str) -> Result<Array> {
    let file = File::open(path)?;
    let mut npz = NpzReader::new(BufReader::new(file))?;
    read_npz_field(&mut npz, field)
}

impl ChunkSource for NpzRecordSource {
    fn name(&self) -> &str {
        &self.field
    }

    fn default_chunk_size(&self) -> ChunkSize {
        ChunkSize::UseBatchSize
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
        self.fnames.len()
    }

    fn can_shuffle(&self) -> bool {
        true
    }

    fn shuffle(&mut self, permutation: &[usize]) -> Result<()> {
        self.fnames = permute(&self.fnames, permutation)?;
        Ok(())
    }

    fn iter(&self) -> ChunkIter<'_> {
        Box::new(
            chunk_ranges(self.fnames.len(), self.chunk_size)
                .map(move |range| self.read_chunk(&self.fnames[range])),
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ndarray::array;
    use ndarray_npy::NpzWriter;

    /// Write `count` records holding `x = [i, i]` and `y = [10 * i]`
    pub(crate) fn write_records(dir: &Path, count: usize) -> Vec<PathBuf> {
        std::fs::create_dir_all(dir).unwrap();
        (0..count)
            .map(|i| {
                let path = dir.join(format!("record_{}.npz", i));
                let mut npz = NpzWriter::new(File::create(&path).unwrap());
                npz.add_array("x", &array![i as f32, i as f32]).unwrap();
                npz.add_array("y", &array![10.0 * i as f64]).unwrap();
                npz.finish().unwrap();
                path
            })
            .collect()
    }

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("streameval_{}_{}", tag, std::process::id()))
    }

    #[test]
    fn test_reads_named_field_per_record() -> Result<()> {
        let dir = temp_dir("npz_fields");
        let fnames = write_records(&dir, 3);

        let x = NpzRecordSource::new("x", fnames.clone())?;
        let y = NpzRecordSource::new("y", fnames)?;

        assert_eq!(x.shape(), &[2]);
        assert_eq!(y.shape(), &[1]);

        let xs: Vec<Array> = x.iter().collect::<Result<_>>()?;
        let ys: Vec<Array> = y.iter().collect::<Result<_>>()?;
        std::fs::remove_dir_all(&dir).ok();

        assert_eq!(xs.len(), 1);
        assert_eq!(xs[0], array![[0.0f32, 0.0], [1.0, 1.0], [2.0, 2.0]].into_dyn());
        assert_eq!(ys[0], array![[0.0f32], [10.0], [20.0]].into_dyn());
        Ok(())
    }

    #[test]
    fn test_last_chunk_is_truncated() -> Result<()> {
        let dir = temp_dir("npz_tail");
        let fnames = write_records(&dir, 5);

        let mut source = NpzRecordSource::new("y", fnames)?;
        source.set_chunk_size(2)?;
        let chunks: Vec<Array> = source.iter().collect::<Result<_>>()?;
        std::fs::remove_dir_all(&dir).ok();

        let rows: Vec<usize> = chunks.iter().map(|c| c.len_of(Axis(0))).collect();
        assert_eq!(rows, vec![2, 2, 1]);
        assert_eq!(chunks[2], array![[40.0f32]].into_dyn());
        Ok(())
    }

    #[test]
    fn test_shuffle_reorders_files() -> Result<()> {
        let dir = temp_dir("npz_shuffle");
        let fnames = write_records(&dir, 3);

        let mut source = NpzRecordSource::new("y", fnames)?;
        source.shuffle(&[2, 0, 1])?;
        let chunk = source.iter().next().unwrap();
        std::fs::remove_dir_all(&dir).ok();

        assert_eq!(chunk?, array![[20.0f32], [0.0], [10.0]].into_dyn());
        Ok(())
    }

    #[test]
    fn test_shape_mismatch_is_reported() -> Result<()> {
        let dir = temp_dir("npz_shape");
        let fnames = write_records(&dir, 2);

        let source = NpzRecordSource::with_shape("x", fnames, vec![3]);
        let result = source.iter().next().unwrap();
        std::fs::remove_dir_all(&dir).ok();

        assert!(matches!(result, Err(EvalError::Shape(_))));
        Ok(())
    }

    #[test]
    fn test_empty_file_list_needs_shape() {
        assert!(matches!(
            NpzRecordSource::new("x", Vec::new()),
            Err(EvalError::Config(_))
        ));
        let source = NpzRecordSource::with_shape("x", Vec::new(), vec![2]);
        assert!(source.is_empty());
        assert_eq!(source.iter().count(), 0);
    }
}
