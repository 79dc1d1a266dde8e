/// Weight loading from safetensors files
use std::path::Path;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;

use crate::{EvalError, Result};

/// Memory-map a safetensors file into a VarBuilder
///
/// # Arguments
/// * `weights_path` - Path to safetensors file
/// * `dtype` - Dtype the parameters are served as
/// * `device` - Device to load parameters on
pub fn load_var_builder<P: AsRef<Path>>(
    weights_path: P,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let path = weights_path.as_ref();
    if !path.is_file() {
        return Err(EvalError::Model(format!(
            "weights file not found: {:?}",
            path
        )));
    }

    log::info!("Loading weights from {:?}", path);

    // The file must not be modified while mapped
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, device)? };
    Ok(vb)
}
