//! Straight-Through Estimator (STE) for uniform quantization.
//!
//! The forward mapping is piecewise constant, so its true derivative is zero
//! almost everywhere. Training instead uses a surrogate gradient:
//!
//! ```text
//! forward:  q = alpha * Q(clamp(x / alpha))
//! dL/dx     = dL/dq                  if lower <= x/alpha <= upper
//!           = 0                      otherwise
//! dL/dalpha = sum(dL/dq * d)         d = (q - x) / alpha   inside the range
//!                                    d = upper             above the range
//!                                    d = lower             below the range
//! ```
//!
//! The threshold gradient is a sum over every element, so
//! [`super::op::QuantizeOp`] multiplies it by [`alpha_grad_scale`] (the LSQ
//! factor `1 / sqrt(n * max_code)`) before handing it to the optimizer.
//!
//! Both halves are plain functions over slices so that they can be tested
//! directly. [`super::op::QuantizeOp`] registers them with candle's autograd.

use super::levels::LevelSet;

/// Gradients produced by [`ste_backward`].
#[derive(Debug, Clone, PartialEq)]
pub struct SteGrad {
    /// Gradient with respect to the quantizer input, same length as the input.
    pub input: Vec<f32>,
    /// Gradient with respect to the clipping threshold.
    pub alpha: f32,
}

/// Quantize `values` to the level set scaled by `alpha`.
///
/// The input is not modified.
#[must_use]
pub fn ste_forward(values: &[f32], alpha: f32, levels: &LevelSet) -> Vec<f32> {
    values
        .iter()
        .map(|&x| levels.value(levels.code(x / alpha), alpha))
        .collect()
}

/// Surrogate gradient of [`ste_forward`].
///
/// `grad` is the gradient flowing into the quantized output and must have the
/// same length as `values`.
#[must_use]
pub fn ste_backward(values: &[f32], alpha: f32, levels: &LevelSet, grad: &[f32]) -> SteGrad {
    debug_assert_eq!(values.len(), grad.len());

    let range = levels.range();
    let mut input = Vec::with_capacity(values.len());
    let mut alpha_grad = 0.0f64;

    for (&x, &g) in values.iter().zip(grad.iter()) {
        let normalized = x / alpha;
        if levels.contains(normalized) {
            input.push(g);
            let q = levels.value(levels.code(normalized), alpha);
            alpha_grad += f64::from(g * (q - x) / alpha);
        } else {
            input.push(0.0);
            if normalized > range.upper() {
                alpha_grad += f64::from(g * range.upper());
            } else if normalized < range.lower() {
                alpha_grad += f64::from(g * range.lower());
            }
        }
    }

    SteGrad {
        input,
        alpha: alpha_grad as f32,
    }
}

/// Scale applied to the threshold gradient of an `len`-element tensor.
#[must_use]
pub fn alpha_grad_scale(len: usize, levels: &LevelSet) -> f32 {
    let n = len.max(1) * usize::from(levels.max_code());
    (n as f32).sqrt().recip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantization::levels::QuantRange;

    fn signed(bits: u8) -> LevelSet {
        LevelSet::new(bits, QuantRange::Signed).unwrap()
    }

    fn unsigned(bits: u8) -> LevelSet {
        LevelSet::new(bits, QuantRange::Unsigned).unwrap()
    }

    #[test]
    fn test_forward_snaps_to_nearest_level() {
        // 2-bit signed, alpha 3: levels {-3, -1, 1, 3}
        let out = ste_forward(&[-2.5, -0.9, 0.1, 1.9, 2.1], 3.0, &signed(2));
        let expected = [-3.0, -1.0, 1.0, 1.0, 3.0];
        for (o, e) in out.iter().zip(expected.iter()) {
            assert!((o - e).abs() < 1e-5, "{out:?}");
        }
    }

    #[test]
    fn test_forward_clamps_out_of_range() {
        let set = unsigned(4);
        let out = ste_forward(&[-4.0, 100.0], 8.0, &set);
        assert_eq!(out[0], set.value(0, 8.0));
        assert_eq!(out[1], set.value(set.max_code(), 8.0));
    }

    #[test]
    fn test_forward_does_not_touch_input() {
        let values = vec![0.3f32, -7.0, 2.2];
        let before = values.clone();
        let _ = ste_forward(&values, 1.0, &signed(4));
        assert_eq!(values, before);
    }

    #[test]
    fn test_backward_passes_in_range_gradient() {
        let grad = ste_backward(&[0.25, -0.5, 0.9], 1.0, &signed(4), &[0.3, -1.2, 2.0]);
        assert_eq!(grad.input, vec![0.3, -1.2, 2.0]);
    }

    #[test]
    fn test_backward_zeroes_clamped_gradient() {
        let grad = ste_backward(&[-3.0, 0.5, 9.0], 2.0, &unsigned(2), &[1.0, 1.0, 1.0]);
        assert_eq!(grad.input, vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_backward_boundary_is_in_range() {
        let grad = ste_backward(&[1.0, -1.0], 1.0, &signed(2), &[0.5, 0.5]);
        assert_eq!(grad.input, vec![0.5, 0.5]);
    }

    #[test]
    fn test_alpha_gradient_outside_range() {
        // Above range contributes +g, below a signed range contributes -g.
        let grad = ste_backward(&[5.0, -5.0, -5.0], 1.0, &signed(2), &[2.0, 1.0, 1.0]);
        assert!((grad.alpha - 0.0).abs() < 1e-6);

        let grad = ste_backward(&[5.0], 1.0, &signed(2), &[2.0]);
        assert!((grad.alpha - 2.0).abs() < 1e-6);

        // Below an unsigned range contributes nothing.
        let grad = ste_backward(&[-5.0], 1.0, &unsigned(2), &[2.0]);
        assert_eq!(grad.alpha, 0.0);
    }

    #[test]
    fn test_alpha_gradient_inside_range() {
        // alpha 1, 1-bit unsigned levels {0, 1}; x = 0.75 -> q = 1, d = 0.25
        let grad = ste_backward(&[0.75], 1.0, &unsigned(1), &[4.0]);
        assert!((grad.alpha - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_alpha_grad_scale_shrinks_with_size() {
        // 4-bit: max_code 15, so 60 elements give 1/sqrt(900).
        assert!((alpha_grad_scale(60, &unsigned(4)) - 1.0 / 30.0).abs() < 1e-7);
        assert!(alpha_grad_scale(10_000, &signed(2)) < alpha_grad_scale(100, &signed(2)));
        assert!(alpha_grad_scale(0, &signed(1)).is_finite());
    }

    #[test]
    fn test_nan_input_gets_zero_gradient() {
        let grad = ste_backward(&[f32::NAN], 1.0, &signed(4), &[1.0]);
        assert_eq!(grad.input, vec![0.0]);
        assert_eq!(grad.alpha, 0.0);
    }
}
