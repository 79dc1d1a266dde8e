/// Model and backend interfaces, plus a feed-forward model
use crate::config::ModelConfig;
use crate::data::{ChunkSource, InMemorySource, Provider};
use crate::utils::{Batch, Outputs};
use crate::{EvalError, Result};

pub mod backend;
pub mod loader;

pub use backend::{CandleBackend, CompiledGraph};

/// Turns a model into something runnable and runs it one batch at a time
pub trait Backend<M: ?Sized> {
    /// Opaque handle produced by `compile`
    type Compiled;

    /// Compile `model` for this backend
    fn compile(&self, model: &M) -> Result<Self::Compiled>;

    /// Run one forward pass; returns one array per output with a row per record
    fn evaluate(&self, model: &M, data: &Batch, compiled: &Self::Compiled) -> Result<Outputs>;
}

/// A model the evaluator can drive
pub trait Model {
    type Backend: Backend<Self>;

    fn backend(&self) -> &Self::Backend;

    /// Whether `build` has run
    fn is_built(&self) -> bool;

    /// Resolve the model structure
    fn build(&mut self) -> Result<()>;

    /// Output names, in order
    fn outputs(&self) -> &[String];

    /// Sources the model itself needs alongside the user's data
    fn data_sources(&self) -> Vec<(String, Box<dyn ChunkSource>)> {
        Vec::new()
    }

    /// Let the model inspect the provider before it is built
    fn register_provider(&mut self, _provider: &dyn Provider) -> Result<()> {
        Ok(())
    }
}

/// Feed-forward model: flattened input, shared hidden trunk, one head per output
pub struct SequentialModel {
    config: ModelConfig,
    backend: CandleBackend,
    outputs: Vec<String>,
    inferred_input_dim: Option<usize>,
    aux_sources: Vec<InMemorySource>,
    built: bool,
}

impl SequentialModel {
    /// Create a model; call `build` (or let the evaluator do it) before use
    pub fn new(config: ModelConfig, backend: CandleBackend) -> Result<Self> {
        config.validate()?;
        let outputs = config.output_names();

        Ok(Self {
            config,
            backend,
            outputs,
            inferred_input_dim: None,
            aux_sources: Vec::new(),
            built: false,
        })
    }

    /// Attach a source the model always needs, e.g. a constant side input
    pub fn with_data_source(mut self, source: InMemorySource) -> Self {
        self.aux_sources.push(source);
        self
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Name of the source fed into the model
    pub fn input_name(&self) -> &str {
        &self.config.input
    }

    /// Flattened input features, once known
    pub fn input_dim(&self) -> Option<usize> {
        self.config.input_dim.or(self.inferred_input_dim)
    }
}

impl Model for SequentialModel {
    type Backend = CandleBackend;

    fn backend(&self) -> &CandleBackend {
        &self.backend
    }

    fn is_built(&self) -> bool {
        self.built
    }

    fn build(&mut self) -> Result<()> {
        self.config.validate()?;

        let input_dim = self.input_dim().ok_or_else(|| {
            EvalError::Model(format!(
                "cannot infer the input dimension of '{}'; set input_dim or register a provider",
                self.config.input
            ))
        })?;

        log::info!(
            "Built model: {} -> {:?} -> {:?}",
            input_dim,
            self.config.hidden,
            self.config
                .outputs
                .iter()
                .map(|o| (o.name.as_str(), o.size))
                .collect::<Vec<_>>()
        );

        self.built = true;
        Ok(())
    }

    fn outputs(&self) -> &[String] {
        &self.outputs
    }

    fn data_sources(&self) -> Vec<(String, Box<dyn ChunkSource>)> {
        self.aux_sources
            .iter()
            .map(|s| {
                let source: Box<dyn ChunkSource> = Box::new(s.clone());
                (s.name().to_string(), source)
            })
            .collect()
    }

    fn register_provider(&mut self, provider: &dyn Provider) -> Result<()> {
        if let Some(shape) = provider.source_shape(&self.config.input) {
            let features: usize = shape.iter().product();
            log::debug!(
                "Input '{}' has shape {:?} ({} features)",
                self.config.input,
                shape,
                features
            );
            self.inferred_input_dim = Some(features);
        }
        Ok(())
    }
}
