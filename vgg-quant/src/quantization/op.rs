//! Candle custom op wiring [`ste_forward`] / [`ste_backward`] into autograd.

use candle_core::{bail, CpuStorage, CustomOp2, Layout, Shape, Tensor};

use super::levels::LevelSet;
use super::ste::{alpha_grad_scale, ste_backward, ste_forward};

/// Uniform quantization of `(input, alpha)` with a straight-through gradient.
///
/// `alpha` must be a single positive element. Only contiguous `f32` CPU
/// storage is supported; callers make inputs contiguous before applying.
#[derive(Debug, Clone, Copy)]
pub struct QuantizeOp {
    levels: LevelSet,
}

impl QuantizeOp {
    /// Create the op for a level set.
    #[must_use]
    pub const fn new(levels: LevelSet) -> Self {
        Self { levels }
    }
}

fn contiguous_f32<'a>(storage: &'a CpuStorage, layout: &Layout) -> candle_core::Result<&'a [f32]> {
    let CpuStorage::F32(data) = storage else {
        bail!("quantize: only f32 tensors are supported");
    };
    match layout.contiguous_offsets() {
        Some((start, end)) => Ok(&data[start..end]),
        None => bail!("quantize: input must be contiguous"),
    }
}

fn positive_alpha(alpha: &[f32]) -> candle_core::Result<f32> {
    match alpha {
        [a] if *a > 0.0 => Ok(*a),
        [a] => bail!("quantize: clipping threshold must be positive, got {a}"),
        _ => bail!("quantize: clipping threshold must have one element, got {}", alpha.len()),
    }
}

impl CustomOp2 for QuantizeOp {
    fn name(&self) -> &'static str {
        "uniform-quantize-ste"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
    ) -> candle_core::Result<(CpuStorage, Shape)> {
        let values = contiguous_f32(s1, l1)?;
        let alpha = positive_alpha(contiguous_f32(s2, l2)?)?;
        let out = ste_forward(values, alpha, &self.levels);
        Ok((CpuStorage::F32(out), l1.shape().clone()))
    }

    fn bwd(
        &self,
        arg1: &Tensor,
        arg2: &Tensor,
        _res: &Tensor,
        grad_res: &Tensor,
    ) -> candle_core::Result<(Option<Tensor>, Option<Tensor>)> {
        let values: Vec<f32> = arg1.flatten_all()?.to_vec1()?;
        let alpha_values: Vec<f32> = arg2.flatten_all()?.to_vec1()?;
        let alpha = positive_alpha(&alpha_values)?;
        let grad: Vec<f32> = grad_res.flatten_all()?.to_vec1()?;

        let grads = ste_backward(&values, alpha, &self.levels, &grad);
        let scale = alpha_grad_scale(values.len(), &self.levels);

        let input_grad = Tensor::from_vec(grads.input, arg1.shape(), arg1.device())?;
        let alpha_grad =
            Tensor::new(grads.alpha * scale, arg2.device())?.reshape(arg2.shape())?;
        Ok((Some(input_grad), Some(alpha_grad)))
    }
}
