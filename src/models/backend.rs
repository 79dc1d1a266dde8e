/// Candle backend for sequential models
use std::path::Path;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

use super::{loader, Backend, Model, SequentialModel};
use crate::layers::Dense;
use crate::utils::{array_to_tensor, count_parameters, row_shape, tensor_to_array, Batch, Outputs};
use crate::{EvalError, Result};

/// Runs models on a candle device
#[derive(Debug, Clone)]
pub struct CandleBackend {
    device: Device,
    dtype: DType,
}

impl CandleBackend {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            dtype: DType::F32,
        }
    }

    pub fn cpu() -> Self {
        Self::new(Device::Cpu)
    }

    /// First CUDA device when available, CPU otherwise
    pub fn cuda_if_available() -> Result<Self> {
        let device = if candle_core::utils::cuda_is_available() {
            Device::new_cuda(0)?
        } else {
            Device::Cpu
        };
        Ok(Self::new(device))
    }

    /// Compute dtype for parameters and activations
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Layers instantiated on a device, ready to run
pub struct CompiledGraph {
    trunk: Vec<Dense>,
    heads: Vec<(String, Dense)>,
    input_dim: usize,
    // set when the weights were freshly initialized rather than loaded
    varmap: Option<VarMap>,
}

impl CompiledGraph {
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Output names, in head order
    pub fn head_names(&self) -> Vec<&str> {
        self.heads.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Write freshly initialized weights to a safetensors file
    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let varmap = self.varmap.as_ref().ok_or_else(|| {
            EvalError::Model("weights were loaded from disk; nothing to save".to_string())
        })?;
        varmap.save(path.as_ref())?;
        Ok(())
    }
}

impl Backend<SequentialModel> for CandleBackend {
    type Compiled = CompiledGraph;

    fn compile(&self, model: &SequentialModel) -> Result<CompiledGraph> {
        let input_dim = model
            .input_dim()
            .filter(|_| model.is_built())
            .ok_or_else(|| {
                EvalError::Model("model must be built before it is compiled".to_string())
            })?;
        let config = model.config();

        let (vb, varmap) = match &config.weights {
            Some(path) => (loader::load_var_builder(path, self.dtype, &self.device)?, None),
            None => {
                let varmap = VarMap::new();
                let vb = VarBuilder::from_varmap(&varmap, self.dtype, &self.device);
                (vb, Some(varmap))
            }
        };

        let mut trunk = Vec::with_capacity(config.hidden.len());
        let mut width = input_dim;
        for (i, &size) in config.hidden.iter().enumerate() {
            trunk.push(Dense::new(
                width,
                size,
                config.activation,
                vb.pp(format!("hidden_{}", i)),
            )?);
            width = size;
        }

        let heads = config
            .outputs
            .iter()
            .map(|o| {
                let vb = vb.pp(format!("head_{}", o.name));
                let head = Dense::new(width, o.size, o.activation, vb)?;
                Ok((o.name.clone(), head))
            })
            .collect::<Result<Vec<_>>>()?;

        if let Some(varmap) = &varmap {
            let params: usize = varmap
                .all_vars()
                .iter()
                .map(|v| count_parameters(v.as_tensor()))
                .sum();
            log::info!("Initialized {} fresh parameters on {:?}", params, self.device);
        }

        Ok(CompiledGraph {
            trunk,
            heads,
            input_dim,
            varmap,
        })
    }

    fn evaluate(
        &self,
        model: &SequentialModel,
        data: &Batch,
        compiled: &CompiledGraph,
    ) -> Result<Outputs> {
        let input = data.get(model.input_name()).ok_or_else(|| {
            let mut available: Vec<&str> = data.keys().map(String::as_str).collect();
            available.sort_unstable();
            EvalError::Model(format!(
                "batch has no '{}' input (available: {})",
                model.input_name(),
                available.join(", ")
            ))
        })?;

        let features: usize = row_shape(input).iter().product();
        if features != compiled.input_dim {
            return Err(EvalError::Shape(format!(
                "input '{}' has {} features per record, model expects {}",
                model.input_name(),
                features,
                compiled.input_dim
            )));
        }

        let mut hidden = array_to_tensor(input, &self.device)?.to_dtype(self.dtype)?;
        for layer in &compiled.trunk {
            hidden = layer.forward(&hidden)?;
        }

        let mut outputs = Outputs::with_capacity(compiled.heads.len());
        for (name, head) in &compiled.heads {
            outputs.insert(name.clone(), tensor_to_array(&head.forward(&hidden)?)?);
        }
        Ok(outputs)
    }
}
