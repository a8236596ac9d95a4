//! VGG16 image classification with 2-bit and 4-bit quantized convolutions.
//!
//! This crate provides:
//! - **Quantizer**: maps tensors onto `2^bits` evenly spaced levels, with a
//!   straight-through gradient for training
//! - **QuantConv2d**: 2D convolution over quantized weights and activations
//! - **VggQuant**: a VGG16 classifier assembled from a topology table, with
//!   2-bit and 4-bit variants
//!
//! Tensors, autograd, batch norm, pooling and linear layers come from candle.
//!
//! # Quick Start
//!
//! ```ignore
//! use vgg_quant::vgg16_quant_4b;
//! use candle_core::{DType, Device, Tensor};
//! use candle_nn::{VarBuilder, VarMap};
//!
//! let device = Device::Cpu;
//! let varmap = VarMap::new();
//! let model = vgg16_quant_4b(VarBuilder::from_varmap(&varmap, DType::F32, &device))?;
//!
//! let images = Tensor::randn(0.0f32, 1.0, (4, 3, 32, 32), &device)?;
//! let scores = model.forward_t(&images, true)?; // [4, 10]
//!
//! for params in model.show_params()? {
//!     println!("{params}");
//! }
//! ```
//!
//! # Quantization
//!
//! Every quantized layer holds two learned clipping thresholds:
//! ```text
//! W_q = alpha_w * Q_signed(clamp(standardize(W) / alpha_w, -1, 1))
//! X_q = alpha_x * Q_unsigned(clamp(X / alpha_x, 0, 1))
//! Y   = conv2d(X_q, W_q)
//! ```
//! where `Q` rounds to the nearest of `2^bits` evenly spaced levels.
//!
//! Gradients use the Straight-Through Estimator: they pass unchanged for
//! inputs inside the clipping range and are zero for clamped inputs.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::doc_markdown)]

mod config;
mod error;
pub mod layer;
pub mod model;
pub mod quantization;

pub use config::{
    LayerSpec, QuantConvConfig, QuantVariant, VggConfig, FULL_PRECISION_STEM_CHANNELS,
};
pub use error::{Result, VggQuantError};
pub use layer::{QuantConv2d, QuantConvParams};
pub use model::{skips_norm, vgg16_quant_2b, vgg16_quant_4b, Block, Stage, VggQuant};
pub use quantization::{
    alpha_grad_scale, ste_backward, ste_forward, LevelSet, PackedCodes, QuantRange, Quantizer, SteGrad,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{LayerSpec, QuantConvConfig, QuantVariant, VggConfig};
    pub use crate::error::{Result, VggQuantError};
    pub use crate::layer::QuantConv2d;
    pub use crate::model::{vgg16_quant_2b, vgg16_quant_4b, VggQuant};
    pub use crate::quantization::{QuantRange, Quantizer};
}
