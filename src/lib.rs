//! Streamed batch evaluation
//!
//! Runs an already-built model over a dataset that is read chunk by chunk,
//! so the inputs never have to sit in memory all at once.
//!
//! # Architecture
//!
//! - **Sources** ([`data::ChunkSource`]): one named field, served as chunks of records
//! - **Supplier** ([`data::Supplier`]): a registry of named sources
//! - **Provider** ([`data::Provider`]): aligns sources into batches
//! - **Evaluator** ([`evaluation::Evaluator`]): compiles the model once, drives
//!   the batches through the backend and merges the per-batch outputs
//!
//! # Example
//!
//! ```ignore
//! use streameval::{Evaluator, ModelConfig, SequentialModel, CandleBackend};
//! use streameval::data::{BatchProvider, Sources, Supplier};
//!
//! let supplier = Supplier::from_file_list("records.txt", &["x", "y"])?;
//! let mut provider = BatchProvider::new(supplier.into_sources(Sources::All)?, 32)?;
//! let model = SequentialModel::new(ModelConfig::from_file("model.json")?, CandleBackend::cpu())?;
//! let mut evaluator = Evaluator::new(model);
//! let (predicted, truth) = evaluator.evaluate(&mut provider)?;
//! ```

pub mod config;
pub mod data;
pub mod evaluation;
pub mod layers;
pub mod models;
pub mod utils;

// Re-export commonly used items
pub use config::{EvalConfig, ModelConfig};
pub use evaluation::Evaluator;
pub use models::{Backend, CandleBackend, Model, SequentialModel};
pub use utils::{Array, Batch, Outputs};

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("Invalid data key: {key}. Valid keys are: {}", .valid.join(", "))]
    UnknownSourceKey { key: String, valid: Vec<String> },

    #[error("Invalid permutation: {0}")]
    InvalidPermutation(String),

    #[error("Source does not support shuffling: {0}")]
    ShuffleUnsupported(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("NumPy read error: {0}")]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),

    #[error("NumPy archive error: {0}")]
    ReadNpz(#[from] ndarray_npy::ReadNpzError),

    #[error("Array shape error: {0}")]
    NdShape(#[from] ndarray::ShapeError),
}

pub type Result<T> = std::result::Result<T, EvalError>;
