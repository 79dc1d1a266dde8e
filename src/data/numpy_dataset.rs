/// NumPy dataset loader (.npy / .npz)
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use ndarray::{ArrayD, Axis, IxDyn, OwnedRepr};
use ndarray_npy::{NpzReader, ReadNpyError, ReadNpyExt, ReadNpzError};
use serde::{Deserialize, Serialize};

use super::memory::InMemorySource;
use super::source::ChunkSource;
use super::supplier::Supplier;
use crate::utils::Array;
use crate::{EvalError, Result};

fn wrong_dtype(err: &ReadNpyError) -> bool {
    matches!(err, ReadNpyError::WrongDescriptor(_))
}

/// Decode a `.npy` payload, casting float64 and integer data to f32
pub fn decode_npy(bytes: &[u8]) -> Result<Array> {
    match ArrayD::<f32>::read_npy(bytes) {
        Err(ref e) if wrong_dtype(e) => {}
        other => return Ok(other?),
    }
    match ArrayD::<f64>::read_npy(bytes) {
        Err(ref e) if wrong_dtype(e) => {}
        other => return Ok(other?.mapv(|v| v as f32)),
    }
    match ArrayD::<i64>::read_npy(bytes) {
        Err(ref e) if wrong_dtype(e) => {}
        other => return Ok(other?.mapv(|v| v as f32)),
    }
    Ok(ArrayD::<i32>::read_npy(bytes)?.mapv(|v| v as f32))
}

/// Read one named array out of an open `.npz` archive, casting to f32
pub fn read_npz_field<R: Read + Seek>(npz: &mut NpzReader<R>, field: &str) -> Result<Array> {
    let entry = format!("{}.npy", field);

    match npz.by_name::<OwnedRepr<f32>, IxDyn>(&entry) {
        Err(ReadNpzError::Npy(ref e)) if wrong_dtype(e) => {}
        other => return Ok(other?),
    }
    match npz.by_name::<OwnedRepr<f64>, IxDyn>(&entry) {
        Err(ReadNpzError::Npy(ref e)) if wrong_dtype(e) => {}
        other => return Ok(other?.mapv(|v| v as f32)),
    }
    match npz.by_name::<OwnedRepr<i64>, IxDyn>(&entry) {
        Err(ReadNpzError::Npy(ref e)) if wrong_dtype(e) => {}
        other => return Ok(other?.mapv(|v| v as f32)),
    }
    Ok(npz
        .by_name::<OwnedRepr<i32>, IxDyn>(&entry)?
        .mapv(|v| v as f32))
}

/// Metadata from dataset.json
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DatasetMetadata {
    #[serde(default)]
    pub num_examples: usize,
    #[serde(default)]
    pub description: String,
}

/// Dataset loaded from one `all__<field>.npy` file per field
pub struct NumpyDataset {
    fields: Vec<(String, Array)>,
    metadata: DatasetMetadata,
}

impl NumpyDataset {
    /// Load `fields` from a directory containing `all__<field>.npy` files and
    /// an optional dataset.json
    pub fn from_directory<P: AsRef<Path>>(path: P, fields: &[&str]) -> Result<Self> {
        let dir = path.as_ref();

        log::info!("Loading NumPy dataset from: {:?}", dir);

        let metadata_path = dir.join("dataset.json");
        let metadata: DatasetMetadata = if metadata_path.exists() {
            let file = File::open(&metadata_path)?;
            serde_json::from_reader(BufReader::new(file))?
        } else {
            log::warn!("dataset.json not found, using defaults");
            DatasetMetadata::default()
        };

        let mut loaded = Vec::with_capacity(fields.len());
        for field in fields {
            let field_path = dir.join(format!("all__{}.npy", field));
            let array = decode_npy(&std::fs::read(&field_path)?)?;
            log::info!("Loaded {}: shape {:?}", field, array.shape());
            loaded.push((field.to_string(), array));
        }

        let dataset = Self::from_arrays(loaded, metadata)?;
        if let Some(declared) = dataset.declared_count_mismatch() {
            log::warn!(
                "dataset.json declares {} examples but {} were loaded",
                declared,
                dataset.len()
            );
        }
        Ok(dataset)
    }

    /// Build from arrays already in memory
    pub fn from_arrays(fields: Vec<(String, Array)>, metadata: DatasetMetadata) -> Result<Self> {
        let mut num_examples = None;
        for (name, array) in &fields {
            if array.ndim() == 0 {
                return Err(EvalError::Shape(format!("field '{}' is a scalar", name)));
            }
            let rows = array.len_of(Axis(0));
            match num_examples {
                None => num_examples = Some(rows),
                Some(n) if n != rows => {
                    return Err(EvalError::Shape(format!(
                        "Record count mismatch: '{}' has {} records, expected {}",
                        name, rows, n
                    )))
                }
                Some(_) => {}
            }
        }

        log::info!(
            "Dataset loaded: {} examples across {} fields",
            num_examples.unwrap_or(0),
            fields.len()
        );

        Ok(Self { fields, metadata })
    }

    /// Get number of examples
    pub fn len(&self) -> usize {
        self.fields
            .first()
            .map(|(_, a)| a.len_of(Axis(0)))
            .unwrap_or(0)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get metadata
    pub fn metadata(&self) -> &DatasetMetadata {
        &self.metadata
    }

    /// Example count declared in dataset.json, when it disagrees with the
    /// loaded data. Zero means no count was declared.
    pub fn declared_count_mismatch(&self) -> Option<usize> {
        let declared = self.metadata.num_examples;
        (declared != 0 && declared != self.len()).then_some(declared)
    }

    /// Field names in load order
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// One in-memory source per field, registered under the field name
    pub fn into_supplier(self) -> Result<Supplier> {
        let mut supplier = Supplier::new();
        for (name, array) in self.fields {
            let source: Box<dyn ChunkSource> = Box::new(InMemorySource::new(name.clone(), array)?);
            supplier.add_source(name, source)?;
        }
        Ok(supplier)
    }
}
