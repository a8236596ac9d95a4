//! Tensor-level quantizer.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use super::levels::{LevelSet, QuantRange};
use super::op::QuantizeOp;
use super::packed::PackedCodes;
use super::ste::ste_forward;
use crate::error::{Result, VggQuantError};

/// Maps a tensor onto `2^bits` evenly spaced levels scaled by a clipping
/// threshold.
///
/// The output has the input's shape and the input is never modified. Gradients
/// reach both the input and the threshold through the straight-through
/// estimator in [`super::ste`]. The threshold gradient is scaled by
/// [`super::alpha_grad_scale`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quantizer {
    levels: LevelSet,
}

impl Quantizer {
    /// Create a quantizer.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `bits` is 0 or larger than 16.
    pub fn new(bits: u8, range: QuantRange) -> Result<Self> {
        Ok(Self {
            levels: LevelSet::new(bits, range)?,
        })
    }

    /// Signed quantizer for weights.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` on an invalid bit-width.
    pub fn signed(bits: u8) -> Result<Self> {
        Self::new(bits, QuantRange::Signed)
    }

    /// Unsigned quantizer for activations.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` on an invalid bit-width.
    pub fn unsigned(bits: u8) -> Result<Self> {
        Self::new(bits, QuantRange::Unsigned)
    }

    /// The level set.
    #[must_use]
    pub const fn level_set(&self) -> &LevelSet {
        &self.levels
    }

    /// Bit-width.
    #[must_use]
    pub const fn bits(&self) -> u8 {
        self.levels.bits()
    }

    /// Number of representable levels.
    #[must_use]
    pub const fn num_levels(&self) -> usize {
        self.levels.num_levels()
    }

    /// Quantize a tensor.
    ///
    /// `alpha` is a single-element tensor holding the clipping threshold. When
    /// either argument tracks gradients the op is recorded for backprop.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if `alpha` has more than one element,
    /// `Quantization` if it is not positive, or a tensor error if the input is
    /// not `f32`.
    pub fn quantize(&self, input: &Tensor, alpha: &Tensor) -> Result<Tensor> {
        check_alpha(alpha)?;
        let input = input.contiguous()?;
        let alpha = alpha.contiguous()?;
        Ok(input.apply_op2(&alpha, QuantizeOp::new(self.levels))?)
    }

    /// Quantize raw values with a fixed clipping threshold.
    ///
    /// # Errors
    ///
    /// Returns error if `alpha` is not positive.
    pub fn quantize_values(&self, values: &[f32], alpha: f32) -> Result<Vec<f32>> {
        check_alpha_value(alpha)?;
        Ok(ste_forward(values, alpha, &self.levels))
    }

    /// Level indices of a tensor, packed at `bits` per element.
    ///
    /// # Errors
    ///
    /// Returns error if the tensor cannot be read or `alpha` is invalid.
    pub fn codes(&self, input: &Tensor, alpha: f32) -> Result<PackedCodes> {
        check_alpha_value(alpha)?;
        let values: Vec<f32> = input
            .flatten_all()?
            .to_dtype(candle_core::DType::F32)?
            .to_vec1()?;
        let codes: Vec<u16> = values
            .iter()
            .map(|&x| self.levels.code(x / alpha))
            .collect();
        PackedCodes::pack(&codes, self.bits())
    }
}

fn check_alpha(alpha: &Tensor) -> Result<()> {
    if alpha.elem_count() != 1 {
        return Err(VggQuantError::shape_mismatch(
            vec![1],
            alpha.dims().to_vec(),
        ));
    }
    let value = alpha
        .flatten_all()?
        .get(0)?
        .to_dtype(candle_core::DType::F32)?
        .to_scalar::<f32>()?;
    check_alpha_value(value)
}

fn check_alpha_value(alpha: f32) -> Result<()> {
    if alpha > 0.0 {
        Ok(())
    } else {
        Err(VggQuantError::Quantization(format!(
            "clipping threshold must be positive, got {alpha}"
        )))
    }
}
