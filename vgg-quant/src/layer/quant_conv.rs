//! QuantConv2d layer - 2D convolution over quantized weights and activations.

use candle_core::Tensor;
use candle_nn::{Init, Module, VarBuilder};
use serde::Serialize;

use crate::config::QuantConvConfig;
use crate::error::{Result, VggQuantError};
use crate::quantization::Quantizer;

/// Added to the weight standard deviation before dividing.
const STD_EPS: f64 = 1e-5;

/// Smallest clipping threshold a layer can use.
const ALPHA_FLOOR: f64 = 1e-4;

/// Clipping threshold used by the quantizers: `|alpha| + ALPHA_FLOOR`.
fn clipping_threshold(alpha: &Tensor) -> Result<Tensor> {
    Ok(alpha.abs()?.affine(1.0, ALPHA_FLOOR)?)
}

/// 2D convolution whose weights and input activations are quantized to
/// `2^bits` levels before the multiply-accumulate.
///
/// Parameters, as registered in the `VarBuilder`:
/// - `weight` `[out, in, k, k]`, full precision, quantized at use time
/// - `bias` `[out]`, only when enabled in the config
/// - `weight_alpha`, `act_alpha`: learned clipping thresholds (rank 0)
///
/// The thresholds are used as `|alpha| + 1e-4`, so any value an optimizer
/// writes to them still gives a valid level set.
///
/// Weights use a signed level set over `[-weight_alpha, weight_alpha]`,
/// activations an unsigned one over `[0, act_alpha]`.
///
/// # Example
///
/// ```ignore
/// use vgg_quant::QuantConv2d;
/// use candle_core::{DType, Device, Tensor};
/// use candle_nn::{VarBuilder, VarMap};
///
/// let device = Device::Cpu;
/// let varmap = VarMap::new();
/// let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
///
/// let conv = QuantConv2d::new(3, 64, 3, 1, 4, vb)?;
/// let input = Tensor::randn(0.0f32, 1.0, (2, 3, 32, 32), &device)?;
/// let output = conv.try_forward(&input)?; // [2, 64, 32, 32]
/// ```
#[derive(Debug, Clone)]
pub struct QuantConv2d {
    weight: Tensor,
    bias: Option<Tensor>,
    weight_alpha: Tensor,
    act_alpha: Tensor,
    weight_quantizer: Quantizer,
    act_quantizer: Quantizer,
    in_channels: usize,
    out_channels: usize,
    config: QuantConvConfig,
}

impl QuantConv2d {
    /// Create a layer with stride 1, no bias and default clipping thresholds.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `bits` is 0 or any dimension is 0.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        padding: usize,
        bits: u8,
        vb: VarBuilder,
    ) -> Result<Self> {
        let config = QuantConvConfig::new(bits)
            .with_kernel_size(kernel_size)
            .with_padding(padding);
        Self::with_config(in_channels, out_channels, &config, vb)
    }

    /// Create a layer from a full configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration is invalid, or a tensor
    /// error if the parameters cannot be created.
    pub fn with_config(
        in_channels: usize,
        out_channels: usize,
        config: &QuantConvConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        config.validate()?;
        if in_channels == 0 || out_channels == 0 {
            return Err(VggQuantError::InvalidConfig(format!(
                "channel counts must be > 0, got {in_channels} -> {out_channels}"
            )));
        }

        let k = config.kernel_size;
        let weight = vb.get_with_hints(
            (out_channels, in_channels, k, k),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = if config.bias {
            Some(vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?)
        } else {
            None
        };
        let weight_alpha =
            vb.get_with_hints((), "weight_alpha", Init::Const(config.weight_alpha_init))?;
        let act_alpha = vb.get_with_hints((), "act_alpha", Init::Const(config.act_alpha_init))?;

        Ok(Self {
            weight,
            bias,
            weight_alpha,
            act_alpha,
            weight_quantizer: Quantizer::signed(config.bits)?,
            act_quantizer: Quantizer::unsigned(config.bits)?,
            in_channels,
            out_channels,
            config: config.clone(),
        })
    }

    /// Input channel count.
    #[must_use]
    pub const fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Output channel count.
    #[must_use]
    pub const fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Bit-width.
    #[must_use]
    pub const fn bits(&self) -> u8 {
        self.config.bits
    }

    /// Number of quantization levels.
    #[must_use]
    pub const fn num_levels(&self) -> usize {
        self.weight_quantizer.num_levels()
    }

    /// Layer configuration.
    #[must_use]
    pub const fn config(&self) -> &QuantConvConfig {
        &self.config
    }

    /// Full-precision weight.
    #[must_use]
    pub const fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Bias, if enabled.
    #[must_use]
    pub const fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Weight clipping threshold.
    #[must_use]
    pub const fn weight_alpha(&self) -> &Tensor {
        &self.weight_alpha
    }

    /// Activation clipping threshold.
    #[must_use]
    pub const fn act_alpha(&self) -> &Tensor {
        &self.act_alpha
    }

    /// Weight and activation thresholds as applied by the forward pass.
    ///
    /// # Errors
    ///
    /// Returns error if a threshold cannot be read.
    pub fn clipping_thresholds(&self) -> Result<(f32, f32)> {
        Ok((
            clipping_threshold(&self.weight_alpha)?.to_scalar::<f32>()?,
            clipping_threshold(&self.act_alpha)?.to_scalar::<f32>()?,
        ))
    }

    /// Spatial output size for an `h x w` input, or `None` if the padded
    /// input is smaller than the kernel.
    #[must_use]
    pub fn output_dims(&self, h: usize, w: usize) -> Option<(usize, usize)> {
        let QuantConvConfig {
            kernel_size: k,
            padding: p,
            stride: s,
            ..
        } = self.config;
        let out = |n: usize| (n + 2 * p).checked_sub(k).map(|d| d / s + 1);
        Some((out(h)?, out(w)?))
    }

    fn standardized_weight(&self) -> Result<Tensor> {
        if !self.config.standardize_weights {
            return Ok(self.weight.clone());
        }
        let mean = self.weight.mean_all()?;
        let centered = self.weight.broadcast_sub(&mean)?;
        let std = centered.sqr()?.mean_all()?.sqrt()?.affine(1.0, STD_EPS)?;
        Ok(centered.broadcast_div(&std)?)
    }

    /// Quantized view of the weight used by the forward pass.
    ///
    /// # Errors
    ///
    /// Returns error if quantization fails.
    pub fn quantized_weight(&self) -> Result<Tensor> {
        self.weight_quantizer
            .quantize(&self.standardized_weight()?, &clipping_threshold(&self.weight_alpha)?)
    }

    fn check_input(&self, dims: &[usize]) -> Result<()> {
        let &[batch, channels, h, w] = dims else {
            return Err(VggQuantError::shape_mismatch(
                vec![dims.first().copied().unwrap_or(1), self.in_channels, 0, 0],
                dims.to_vec(),
            ));
        };
        if channels != self.in_channels {
            return Err(VggQuantError::shape_mismatch(
                vec![batch, self.in_channels, h, w],
                dims.to_vec(),
            ));
        }
        if self.output_dims(h, w).is_none() {
            let min = self.config.kernel_size.saturating_sub(2 * self.config.padding);
            return Err(VggQuantError::shape_mismatch(
                vec![batch, self.in_channels, h.max(min), w.max(min)],
                dims.to_vec(),
            ));
        }
        Ok(())
    }

    /// Forward pass.
    ///
    /// Quantizes the weight and the input, then runs a standard convolution
    /// over the quantized operands. The output is
    /// `[batch, out_channels, h_out, w_out]`.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the input is not 4D, its channel count
    /// differs from `in_channels`, or it is smaller than the kernel.
    pub fn try_forward(&self, input: &Tensor) -> Result<Tensor> {
        self.check_input(input.dims())?;

        let weight = self.quantized_weight()?;
        let input = self
            .act_quantizer
            .quantize(input, &clipping_threshold(&self.act_alpha)?)?;
        let output = input.conv2d(&weight, self.config.padding, self.config.stride, 1, 1)?;

        match &self.bias {
            Some(bias) => {
                let bias = bias.reshape((1, self.out_channels, 1, 1))?;
                Ok(output.broadcast_add(&bias)?)
            }
            None => Ok(output),
        }
    }

    /// Report the layer's quantization state.
    ///
    /// Reads parameters only; nothing is modified. The report is also logged
    /// at `info` level.
    ///
    /// # Errors
    ///
    /// Returns error if a parameter cannot be read.
    pub fn show_params(&self) -> Result<QuantConvParams> {
        let (weight_alpha, act_alpha) = self.clipping_thresholds()?;
        let codes = self
            .weight_quantizer
            .codes(&self.standardized_weight()?, weight_alpha)?;

        let params = QuantConvParams {
            bits: self.bits(),
            num_levels: self.num_levels(),
            in_channels: self.in_channels,
            out_channels: self.out_channels,
            kernel_size: self.config.kernel_size,
            weight_alpha,
            act_alpha,
            weight_levels_used: codes.histogram().iter().filter(|&&n| n > 0).count(),
            compression_ratio: codes.compression_ratio(),
        };
        tracing::info!(
            bits = params.bits,
            in_channels = params.in_channels,
            out_channels = params.out_channels,
            "{params}"
        );
        Ok(params)
    }
}

impl Module for QuantConv2d {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.try_forward(xs).map_err(VggQuantError::into_candle)
    }
}

/// Quantization statistics of one [`QuantConv2d`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuantConvParams {
    /// Bit-width.
    pub bits: u8,
    /// Number of representable levels, `2^bits`.
    pub num_levels: usize,
    /// Input channel count.
    pub in_channels: usize,
    /// Output channel count.
    pub out_channels: usize,
    /// Kernel size.
    pub kernel_size: usize,
    /// Current weight clipping threshold.
    pub weight_alpha: f32,
    /// Current activation clipping threshold.
    pub act_alpha: f32,
    /// Distinct levels the quantized weight actually uses.
    pub weight_levels_used: usize,
    /// Packed weight size vs FP32.
    pub compression_ratio: f32,
}

impl std::fmt::Display for QuantConvParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "QuantConv2d({} -> {}, k={}, {}-bit, {} levels): \
             clipping threshold weight alpha {:.3}, activation alpha {:.3}, \
             {}/{} weight levels used, {:.1}x packed",
            self.in_channels,
            self.out_channels,
            self.kernel_size,
            self.bits,
            self.num_levels,
            self.weight_alpha,
            self.act_alpha,
            self.weight_levels_used,
            self.num_levels,
            self.compression_ratio,
        )
    }
}
