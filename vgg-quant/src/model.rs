//! Quantized VGG classifier.
//!
//! The feature extractor is assembled from a [`VggConfig`] table:
//! - `MaxPool` entries become 2x2 max pooling with stride 2
//! - `Conv(n)` entries become `QuantConv2d -> BatchNorm -> ReLU`, except that
//!   an `s -> s` transition with `s == variant.sentinel_channels()` drops the
//!   batch norm (`QuantConv2d -> ReLU`)
//! - `FullPrecisionConv(n)` entries become `Conv2d -> BatchNorm -> ReLU`
//!
//! A size-1 average pool closes the feature stack, followed by a flatten and a
//! single linear layer producing the class scores.

use candle_core::Tensor;
use candle_nn::{BatchNorm, BatchNormConfig, Conv2dConfig, Linear, Module, ModuleT, VarBuilder};
use serde::Serialize;

use crate::config::{LayerSpec, QuantVariant, VggConfig};
use crate::error::{Result, VggQuantError};
use crate::layer::{QuantConv2d, QuantConvParams};

/// One stage of the assembled pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    /// Quantized convolution.
    QuantConv {
        /// Input channels.
        in_channels: usize,
        /// Output channels.
        out_channels: usize,
        /// Bit-width.
        bits: u8,
    },
    /// Full-precision convolution.
    Conv {
        /// Input channels.
        in_channels: usize,
        /// Output channels.
        out_channels: usize,
    },
    /// Batch normalization over this many channels.
    BatchNorm(usize),
    /// Rectified linear unit.
    Relu,
    /// 2x2 max pooling, stride 2.
    MaxPool,
    /// 1x1 average pooling, stride 1.
    AvgPool,
    /// Flatten everything but the batch dimension.
    Flatten,
    /// Linear classifier.
    Linear {
        /// Input features.
        in_features: usize,
        /// Output features.
        out_features: usize,
    },
}

/// A block of the feature extractor.
#[derive(Debug, Clone)]
pub enum Block {
    /// 2x2 max pooling with stride 2.
    MaxPool,
    /// Quantized conv, optional batch norm, ReLU.
    QuantConv {
        /// The quantized convolution.
        conv: QuantConv2d,
        /// Batch norm, absent for the sentinel transition.
        norm: Option<BatchNorm>,
    },
    /// Full-precision conv, batch norm, ReLU.
    FullPrecisionConv {
        /// The convolution.
        conv: candle_nn::Conv2d,
        /// Batch norm.
        norm: BatchNorm,
        /// Input channels.
        in_channels: usize,
        /// Output channels.
        out_channels: usize,
    },
    /// 1x1 average pooling with stride 1.
    AvgPool,
}

impl Block {
    /// Whether the block contains a batch norm.
    #[must_use]
    pub const fn has_norm(&self) -> bool {
        match self {
            Self::QuantConv { norm, .. } => norm.is_some(),
            Self::FullPrecisionConv { .. } => true,
            Self::MaxPool | Self::AvgPool => false,
        }
    }

    /// The quantized convolution of this block, if any.
    #[must_use]
    pub const fn quant_conv(&self) -> Option<&QuantConv2d> {
        match self {
            Self::QuantConv { conv, .. } => Some(conv),
            _ => None,
        }
    }

    /// Stages of this block in execution order.
    #[must_use]
    pub fn stages(&self) -> Vec<Stage> {
        match self {
            Self::MaxPool => vec![Stage::MaxPool],
            Self::AvgPool => vec![Stage::AvgPool],
            Self::QuantConv { conv, norm } => {
                let mut stages = vec![Stage::QuantConv {
                    in_channels: conv.in_channels(),
                    out_channels: conv.out_channels(),
                    bits: conv.bits(),
                }];
                if norm.is_some() {
                    stages.push(Stage::BatchNorm(conv.out_channels()));
                }
                stages.push(Stage::Relu);
                stages
            }
            Self::FullPrecisionConv {
                in_channels,
                out_channels,
                ..
            } => vec![
                Stage::Conv {
                    in_channels: *in_channels,
                    out_channels: *out_channels,
                },
                Stage::BatchNorm(*out_channels),
                Stage::Relu,
            ],
        }
    }

    /// Forward pass. `train` selects batch statistics in batch norm.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if a convolution receives the wrong channel
    /// count, or a tensor error.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::MaxPool => Ok(xs.max_pool2d_with_stride(2, 2)?),
            Self::AvgPool => Ok(xs.avg_pool2d(1)?),
            Self::QuantConv { conv, norm } => {
                let ys = conv.try_forward(xs)?;
                let ys = match norm {
                    Some(norm) => norm.forward_t(&ys, train)?,
                    None => ys,
                };
                Ok(ys.relu()?)
            }
            Self::FullPrecisionConv {
                conv,
                norm,
                in_channels,
                ..
            } => {
                let dims = xs.dims();
                if dims.len() != 4 || dims[1] != *in_channels {
                    let mut expected = dims.to_vec();
                    if expected.len() == 4 {
                        expected[1] = *in_channels;
                    }
                    return Err(VggQuantError::shape_mismatch(expected, dims.to_vec()));
                }
                let ys = conv.forward(xs)?;
                Ok(norm.forward_t(&ys, train)?.relu()?)
            }
        }
    }
}

/// Quantized VGG image classifier.
///
/// # Example
///
/// ```ignore
/// use vgg_quant::{vgg16_quant_4b, VggQuant};
/// use candle_core::{DType, Device, Tensor};
/// use candle_nn::{VarBuilder, VarMap};
///
/// let device = Device::Cpu;
/// let varmap = VarMap::new();
/// let model = vgg16_quant_4b(VarBuilder::from_varmap(&varmap, DType::F32, &device))?;
///
/// let images = Tensor::randn(0.0f32, 1.0, (8, 3, 32, 32), &device)?;
/// let scores = model.forward_t(&images, false)?; // [8, 10]
/// model.show_params()?;
/// ```
#[derive(Debug, Clone)]
pub struct VggQuant {
    features: Vec<Block>,
    classifier: Linear,
    config: VggConfig,
}

impl VggQuant {
    /// Assemble the network described by `config`.
    ///
    /// Parameters are created under `features.{i}.*` and `classifier.*`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration is invalid, or a tensor
    /// error if parameters cannot be created.
    pub fn new(config: &VggConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let variant = config.variant;
        let conv_config = config.conv_config();
        let bn_config = BatchNormConfig {
            eps: config.bn_eps,
            ..Default::default()
        };

        let mut features = Vec::with_capacity(config.layers.len() + 1);
        let mut in_channels = config.in_channels;

        for (i, spec) in config.layers.iter().enumerate() {
            let vb_block = vb.pp(format!("features.{i}"));
            let block = match *spec {
                LayerSpec::MaxPool => Block::MaxPool,
                LayerSpec::Conv(out_channels) => {
                    let conv = QuantConv2d::with_config(
                        in_channels,
                        out_channels,
                        &conv_config,
                        vb_block.pp("conv"),
                    )?;
                    let norm = if skips_norm(variant, in_channels, out_channels) {
                        tracing::debug!(
                            block = i,
                            channels = out_channels,
                            "sentinel transition, building without batch norm"
                        );
                        None
                    } else {
                        Some(candle_nn::batch_norm(out_channels, bn_config, vb_block.pp("bn"))?)
                    };
                    Block::QuantConv { conv, norm }
                }
                LayerSpec::FullPrecisionConv(out_channels) => {
                    let conv = candle_nn::conv2d_no_bias(
                        in_channels,
                        out_channels,
                        3,
                        Conv2dConfig {
                            padding: 1,
                            ..Default::default()
                        },
                        vb_block.pp("conv"),
                    )?;
                    let norm = candle_nn::batch_norm(out_channels, bn_config, vb_block.pp("bn"))?;
                    Block::FullPrecisionConv {
                        conv,
                        norm,
                        in_channels,
                        out_channels,
                    }
                }
            };
            tracing::debug!(block = i, stages = ?block.stages(), "assembled block");

            if let LayerSpec::Conv(c) | LayerSpec::FullPrecisionConv(c) = *spec {
                in_channels = c;
            }
            features.push(block);
        }
        features.push(Block::AvgPool);

        let classifier = candle_nn::linear(in_channels, config.num_classes, vb.pp("classifier"))?;

        tracing::info!(
            variant = %variant,
            blocks = features.len(),
            num_classes = config.num_classes,
            "built quantized VGG"
        );

        Ok(Self {
            features,
            classifier,
            config: config.clone(),
        })
    }

    /// Model configuration.
    #[must_use]
    pub const fn config(&self) -> &VggConfig {
        &self.config
    }

    /// Bit-width selector.
    #[must_use]
    pub const fn variant(&self) -> QuantVariant {
        self.config.variant
    }

    /// Feature extractor blocks.
    #[must_use]
    pub fn blocks(&self) -> &[Block] {
        &self.features
    }

    /// Width of the classifier input.
    #[must_use]
    pub fn classifier_in_features(&self) -> usize {
        self.config.feature_channels()
    }

    /// Flat description of the whole pipeline in execution order.
    #[must_use]
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages: Vec<Stage> = self.features.iter().flat_map(Block::stages).collect();
        stages.push(Stage::Flatten);
        stages.push(Stage::Linear {
            in_features: self.classifier_in_features(),
            out_features: self.config.num_classes,
        });
        stages
    }

    /// Quantized convolutions in execution order.
    pub fn quant_convs(&self) -> impl Iterator<Item = &QuantConv2d> {
        self.features.iter().filter_map(Block::quant_conv)
    }

    /// Class scores `[batch, num_classes]`.
    ///
    /// `train` selects batch statistics (and running-stat updates) in batch
    /// norm; the quantized convolutions behave the same in both modes.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the input channels disagree with the first
    /// layer or the spatial size does not reduce to the classifier width.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut ys = xs.clone();
        for block in &self.features {
            ys = block.forward_t(&ys, train)?;
        }

        let ys = ys.flatten_from(1)?;
        let (batch, width) = ys.dims2()?;
        let expected = self.classifier_in_features();
        if width != expected {
            return Err(VggQuantError::shape_mismatch(
                vec![batch, expected],
                vec![batch, width],
            ));
        }
        Ok(self.classifier.forward(&ys)?)
    }

    /// Report every quantized layer in execution order.
    ///
    /// # Errors
    ///
    /// Returns error if a layer's parameters cannot be read.
    pub fn show_params(&self) -> Result<Vec<QuantConvParams>> {
        self.quant_convs().map(QuantConv2d::show_params).collect()
    }
}

impl ModuleT for VggQuant {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        Self::forward_t(self, xs, train).map_err(VggQuantError::into_candle)
    }
}

/// Whether a conv block is built without batch norm.
#[must_use]
pub const fn skips_norm(variant: QuantVariant, in_channels: usize, out_channels: usize) -> bool {
    let sentinel = variant.sentinel_channels();
    in_channels == sentinel && out_channels == sentinel
}

/// VGG16 with 4-bit quantized convolutions and a 10-class head.
///
/// Use [`VggQuant::new`] with a customized [`VggConfig::vgg16_quant_4b`] to
/// change the head or the conv template.
///
/// # Errors
///
/// Returns error if parameters cannot be created.
pub fn vgg16_quant_4b(vb: VarBuilder) -> Result<VggQuant> {
    VggQuant::new(&VggConfig::vgg16_quant_4b(), vb)
}

/// VGG16 with 2-bit quantized convolutions and a 10-class head.
///
/// # Errors
///
/// Returns error if parameters cannot be created.
pub fn vgg16_quant_2b(vb: VarBuilder) -> Result<VggQuant> {
    VggQuant::new(&VggConfig::vgg16_quant_2b(), vb)
}
