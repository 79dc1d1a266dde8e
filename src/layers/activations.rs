/// Activation functions and the dense layer used by sequential models
use candle_core::{DType, Result, Tensor};
use candle_nn::{Init, VarBuilder};
use serde::{Deserialize, Serialize};

/// Element-wise activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Relu,
    Gelu,
    Silu,
    Tanh,
    Sigmoid,
    Identity,
}

impl Activation {
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Relu => x.relu(),
            Self::Gelu => x.gelu(),
            Self::Silu => candle_nn::ops::silu(x),
            Self::Tanh => x.tanh(),
            Self::Sigmoid => candle_nn::ops::sigmoid(x),
            Self::Identity => Ok(x.clone()),
        }
    }
}

/// Linear layer with automatic dtype casting
///
/// Casts weights and bias to the input dtype before computation, so f32
/// inputs can run against f16/bf16 checkpoints.
pub struct CastedLinear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl CastedLinear {
    /// Create new CastedLinear layer
    ///
    /// # Arguments
    /// * `in_features` - Input dimension
    /// * `out_features` - Output dimension
    /// * `bias` - Whether to include bias
    /// * `vb` - VarBuilder holding (or initializing) the parameters
    pub fn new(
        in_features: usize,
        out_features: usize,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let init_ws = candle_nn::init::DEFAULT_KAIMING_NORMAL;
        let weight = vb.get_with_hints((out_features, in_features), "weight", init_ws)?;

        let bias = if bias {
            let bound = 1. / (in_features as f64).sqrt();
            let init_bs = Init::Uniform { lo: -bound, up: bound };
            Some(vb.get_with_hints(out_features, "bias", init_bs)?)
        } else {
            None
        };

        Ok(Self { weight, bias })
    }

    fn cast(t: &Tensor, dtype: DType) -> Result<Tensor> {
        if t.dtype() != dtype {
            t.to_dtype(dtype)
        } else {
            Ok(t.clone())
        }
    }

    /// Forward pass: `input @ weight^T + bias`
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let dtype = input.dtype();

        // weight is [out_features, in_features]
        let weight_t = Self::cast(&self.weight, dtype)?.t()?;
        let output = input.broadcast_matmul(&weight_t)?;

        match &self.bias {
            Some(b) => output.broadcast_add(&Self::cast(b, dtype)?),
            None => Ok(output),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.dims()[0]
    }
}

/// Linear layer followed by an activation
pub struct Dense {
    linear: CastedLinear,
    activation: Activation,
}

impl Dense {
    pub fn new(
        in_features: usize,
        out_features: usize,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let linear = CastedLinear::new(in_features, out_features, true, vb)?;
        Ok(Self { linear, activation })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.activation.forward(&self.linear.forward(x)?)
    }

    pub fn out_features(&self) -> usize {
        self.linear.out_features()
    }
}
