//! Neural network layers with quantized arithmetic.
//!
//! This module provides:
//! - `QuantConv2d`: 2D convolution over quantized weights and activations
//! - `QuantConvParams`: read-only report produced by `show_params`

mod quant_conv;

pub use quant_conv::{QuantConv2d, QuantConvParams};
