/// Shared array types and helpers
use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use ndarray::{ArrayD, Axis, IxDyn};

use crate::{EvalError, Result};

/// Host-side array; axis 0 is always the record axis
pub type Array = ArrayD<f32>;

/// One aligned set of chunks, keyed by source name
pub type Batch = HashMap<String, Array>;

/// Per-output arrays, keyed by model output name
pub type Outputs = HashMap<String, Array>;

/// Return any one value of a map
pub fn get_any_value<V>(map: &HashMap<String, V>) -> Option<&V> {
    map.values().next()
}

/// Length of the leading (record) axis
pub fn leading_dim(array: &Array) -> Result<usize> {
    array.shape().first().copied().ok_or_else(|| {
        EvalError::Shape("scalar array has no record axis".to_string())
    })
}

/// Shape of one record, i.e. everything after the record axis
pub fn row_shape(array: &Array) -> &[usize] {
    array.shape().get(1..).unwrap_or(&[])
}

/// Number of records in a batch.
///
/// Every value must agree on the leading dimension. An empty batch has zero
/// records.
pub fn batch_len(batch: &Batch) -> Result<usize> {
    let Some(first) = get_any_value(batch) else {
        return Ok(0);
    };
    let rows = leading_dim(first)?;

    for (name, value) in batch {
        let n = leading_dim(value)?;
        if n != rows {
            return Err(EvalError::Shape(format!(
                "batch values disagree on record count: '{}' has {} rows, expected {}",
                name, n, rows
            )));
        }
    }

    Ok(rows)
}

/// Concatenate chunks along the record axis
pub fn concatenate_rows(chunks: &[Array]) -> Result<Array> {
    let views: Vec<_> = chunks.iter().map(|c| c.view()).collect();
    Ok(ndarray::concatenate(Axis(0), &views)?)
}

/// Flatten every record of `array` and upload it as a `[records, features]` tensor
pub fn array_to_tensor(array: &Array, device: &Device) -> candle_core::Result<Tensor> {
    let rows = array.shape().first().copied().unwrap_or(1);
    let features: usize = row_shape(array).iter().product();

    // `iter` walks logical order, whatever the memory layout
    let data: Vec<f32> = array.iter().copied().collect();
    Tensor::from_vec(data, (rows, features), device)
}

/// Download a tensor into a host array of the same shape
pub fn tensor_to_array(tensor: &Tensor) -> Result<Array> {
    let dims = tensor.dims().to_vec();
    let data = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    Ok(ArrayD::from_shape_vec(IxDyn(&dims), data)?)
}

/// Calculate the number of parameters in a tensor
pub fn count_parameters(tensor: &Tensor) -> usize {
    tensor.dims().iter().product()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_batch_len_agrees() -> Result<()> {
        let mut batch = Batch::new();
        batch.insert("x".to_string(), array![[1.0f32], [2.0]].into_dyn());
        batch.insert("y".to_string(), array![3.0f32, 4.0].into_dyn());

        assert_eq!(batch_len(&batch)?, 2);
        assert_eq!(batch_len(&Batch::new())?, 0);
        Ok(())
    }

    #[test]
    fn test_batch_len_mismatch() {
        let mut batch = Batch::new();
        batch.insert("x".to_string(), array![[1.0f32], [2.0]].into_dyn());
        batch.insert("y".to_string(), array![3.0f32].into_dyn());

        assert!(matches!(batch_len(&batch), Err(EvalError::Shape(_))));
    }

    #[test]
    fn test_concatenate_rows() -> Result<()> {
        let chunks = vec![
            array![[0.0f32], [1.0]].into_dyn(),
            array![[2.0f32]].into_dyn(),
        ];
        let joined = concatenate_rows(&chunks)?;
        assert_eq!(joined, array![[0.0f32], [1.0], [2.0]].into_dyn());
        Ok(())
    }

    #[test]
    fn test_tensor_round_trip_keeps_rows() -> Result<()> {
        let device = Device::Cpu;
        let arr = array![[[1.0f32, 2.0], [3.0, 4.0]], [[5.0, 6.0], [7.0, 8.0]]].into_dyn();

        let tensor = array_to_tensor(&arr, &device)?;
        assert_eq!(tensor.dims(), &[2, 4]);

        let back = tensor_to_array(&tensor)?;
        assert_eq!(back.shape(), &[2, 4]);
        assert_eq!(back[[1, 0]], 5.0);
        Ok(())
    }
}
