/// Data loading: chunked sources, the source registry and batch providers
pub mod memory;
pub mod npz;
pub mod numpy_dataset;
pub mod provider;
pub mod source;
pub mod supplier;

pub use memory::InMemorySource;
pub use npz::NpzRecordSource;
pub use numpy_dataset::{DatasetMetadata, NumpyDataset};
pub use provider::{BatchIter, BatchProvider, Provider};
pub use source::{ChunkIter, ChunkSize, ChunkSource, DEFAULT_CHUNK_SIZE};
pub use supplier::{Sources, Supplier};
