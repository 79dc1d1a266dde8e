/// Neural network layer primitives
///
/// Building blocks for the sequential model:
/// - Activations (ReLU, GELU, SiLU, tanh, sigmoid)
/// - Linear layers with automatic dtype casting

pub mod activations;

pub use activations::{Activation, CastedLinear, Dense};
