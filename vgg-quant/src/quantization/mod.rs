//! Uniform quantization with straight-through gradients.
//!
//! This module provides:
//! - **Level sets**: `2^bits` evenly spaced levels over a signed or unsigned range
//! - **STE**: explicit forward mapping and surrogate backward mapping
//! - **Quantizer**: tensor API registered with candle autograd
//! - **Packed codes**: dense `bits`-wide storage of level indices

mod levels;
mod op;
mod packed;
mod quantizer;
mod ste;

pub use levels::{validate_bits, LevelSet, QuantRange, MAX_BITS};
pub use op::QuantizeOp;
pub use packed::PackedCodes;
pub use quantizer::Quantizer;
pub use ste::{alpha_grad_scale, ste_backward, ste_forward, SteGrad};
