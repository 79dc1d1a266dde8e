/// Configuration for models and evaluation runs
///
/// Both structs deserialize from JSON and are checked with `validate()`
/// before use.
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::layers::Activation;
use crate::{EvalError, Result};

fn read_json<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let file = File::open(path.as_ref())?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

fn default_output_activation() -> Activation {
    Activation::Identity
}

/// One named model output ("head")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output name; ground truth is looked up under the same name
    pub name: String,

    /// Features per record
    pub size: usize,

    /// Activation applied to the head
    #[serde(default = "default_output_activation")]
    pub activation: Activation,
}

/// Configuration for a feed-forward model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Name of the data source fed into the model
    pub input: String,

    /// Flattened features per input record. Inferred from the provider
    /// when left out.
    #[serde(default)]
    pub input_dim: Option<usize>,

    /// Hidden layer sizes, applied in order
    #[serde(default)]
    pub hidden: Vec<usize>,

    /// Activation between hidden layers
    #[serde(default)]
    pub activation: Activation,

    /// Output heads
    pub outputs: Vec<OutputConfig>,

    /// Safetensors file with trained weights; fresh weights when absent
    #[serde(default)]
    pub weights: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            input: "x".to_string(),
            input_dim: None,
            hidden: vec![64],
            activation: Activation::Relu,
            outputs: vec![OutputConfig {
                name: "y".to_string(),
                size: 1,
                activation: Activation::Identity,
            }],
            weights: None,
        }
    }
}

impl ModelConfig {
    /// Load from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = read_json(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.input.is_empty() {
            return Err(EvalError::Config("input name must not be empty".to_string()));
        }

        if self.input_dim == Some(0) {
            return Err(EvalError::Config("input_dim must be > 0".to_string()));
        }

        if self.hidden.iter().any(|&h| h == 0) {
            return Err(EvalError::Config(
                "hidden layer sizes must be > 0".to_string(),
            ));
        }

        if self.outputs.is_empty() {
            return Err(EvalError::Config(
                "model needs at least one output".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for output in &self.outputs {
            if output.size == 0 {
                return Err(EvalError::Config(format!(
                    "output '{}' must have size > 0",
                    output.name
                )));
            }
            if !seen.insert(output.name.as_str()) {
                return Err(EvalError::Config(format!(
                    "duplicate output name: {}",
                    output.name
                )));
            }
        }

        Ok(())
    }

    /// Output names in declaration order
    pub fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|o| o.name.clone()).collect()
    }
}

/// Settings for one evaluation run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Records per batch
    pub batch_size: usize,

    /// Shuffle sources before each pass
    pub shuffle: bool,

    /// Seed for the shuffle; a random seed is used when absent
    pub seed: Option<u64>,

    /// Stop after this many batches
    pub num_batches: Option<usize>,

    /// Log progress every N batches
    pub log_every: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: false,
            seed: None,
            num_batches: None,
            log_every: 100,
        }
    }
}

impl EvalConfig {
    /// Load from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = read_json(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(EvalError::Config("batch_size must be > 0".to_string()));
        }

        if self.num_batches == Some(0) {
            return Err(EvalError::Config("num_batches must be > 0".to_string()));
        }

        if self.log_every == 0 {
            return Err(EvalError::Config("log_every must be > 0".to_string()));
        }

        Ok(())
    }
}
