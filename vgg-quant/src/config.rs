//! Configuration for quantized convolutions and the VGG topology.

use serde::{Deserialize, Serialize};

use crate::error::{Result, VggQuantError};
use crate::quantization::validate_bits;

/// Configuration of a single quantized convolution.
///
/// The defaults match the VGG16 blocks: 3x3 kernel, padding 1, stride 1 and
/// no bias, since every block but the sentinel one is followed by batch norm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantConvConfig {
    /// Bit-width shared by weight and activation quantizers.
    pub bits: u8,

    /// Square kernel size.
    pub kernel_size: usize,

    /// Zero padding on each spatial side.
    pub padding: usize,

    /// Convolution stride.
    pub stride: usize,

    /// Whether the layer carries a bias term.
    pub bias: bool,

    /// Standardize weights (zero mean, unit std) before quantization.
    pub standardize_weights: bool,

    /// Initial clipping threshold for weights.
    pub weight_alpha_init: f64,

    /// Initial clipping threshold for activations.
    pub act_alpha_init: f64,
}

impl Default for QuantConvConfig {
    fn default() -> Self {
        Self {
            bits: 4,
            kernel_size: 3,
            padding: 1,
            stride: 1,
            bias: false,
            standardize_weights: true,
            weight_alpha_init: 3.0,
            act_alpha_init: 8.0,
        }
    }
}

impl QuantConvConfig {
    /// Create a configuration with the given bit-width and defaults otherwise.
    #[must_use]
    pub fn new(bits: u8) -> Self {
        Self {
            bits,
            ..Default::default()
        }
    }

    /// Set the bit-width.
    #[must_use]
    pub const fn with_bits(mut self, bits: u8) -> Self {
        self.bits = bits;
        self
    }

    /// Set the kernel size.
    #[must_use]
    pub const fn with_kernel_size(mut self, kernel_size: usize) -> Self {
        self.kernel_size = kernel_size;
        self
    }

    /// Set the padding.
    #[must_use]
    pub const fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    /// Set the stride.
    #[must_use]
    pub const fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    /// Enable or disable the bias term.
    #[must_use]
    pub const fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    /// Enable or disable weight standardization.
    #[must_use]
    pub const fn with_weight_standardization(mut self, enabled: bool) -> Self {
        self.standardize_weights = enabled;
        self
    }

    /// Set the initial clipping thresholds.
    #[must_use]
    pub const fn with_alpha_init(mut self, weight_alpha: f64, act_alpha: f64) -> Self {
        self.weight_alpha_init = weight_alpha;
        self.act_alpha_init = act_alpha;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        validate_bits(self.bits)?;

        if self.kernel_size == 0 {
            return Err(VggQuantError::invalid_config("kernel_size must be > 0"));
        }

        if self.stride == 0 {
            return Err(VggQuantError::invalid_config("stride must be > 0"));
        }

        if self.weight_alpha_init <= 0.0 || self.act_alpha_init <= 0.0 {
            return Err(VggQuantError::invalid_config(
                "clipping thresholds must be > 0",
            ));
        }

        Ok(())
    }
}

/// Bit-width selector for the whole network, resolved once at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuantVariant {
    /// 2-bit weights and activations.
    TwoBit,
    /// 4-bit weights and activations.
    FourBit,
}

impl QuantVariant {
    /// Select a variant from a bit-width.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for anything but 2 or 4.
    pub fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            2 => Ok(Self::TwoBit),
            4 => Ok(Self::FourBit),
            other => Err(VggQuantError::InvalidConfig(format!(
                "no VGG16 variant for {other}-bit quantization (expected 2 or 4)"
            ))),
        }
    }

    /// Bit-width of every quantized layer.
    #[must_use]
    pub const fn bits(self) -> u8 {
        match self {
            Self::TwoBit => 2,
            Self::FourBit => 4,
        }
    }

    /// Channel count whose `n -> n` transition is built without batch norm.
    #[must_use]
    pub const fn sentinel_channels(self) -> usize {
        match self {
            Self::TwoBit => 16,
            Self::FourBit => 8,
        }
    }

    /// Configuration name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::TwoBit => "VGG16_quant_2b",
            Self::FourBit => "VGG16_quant_4b",
        }
    }

    /// VGG16 layer table for this variant.
    #[must_use]
    pub fn vgg16_layers(self) -> Vec<LayerSpec> {
        use LayerSpec::{Conv, MaxPool};
        let s = self.sentinel_channels();
        vec![
            Conv(64),
            Conv(64),
            MaxPool,
            Conv(128),
            Conv(128),
            MaxPool,
            Conv(256),
            Conv(256),
            Conv(256),
            MaxPool,
            Conv(s),
            Conv(s),
            Conv(512),
            MaxPool,
            Conv(512),
            Conv(512),
            Conv(512),
            MaxPool,
        ]
    }
}

impl std::fmt::Display for QuantVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Output channels of the full-precision stem produced by `"F"`.
pub const FULL_PRECISION_STEM_CHANNELS: usize = 64;

/// One entry of a topology table.
///
/// Serialized in the compact table form: an integer for a quantized conv
/// block, `"M"` for max pooling and `"F"` for a full-precision 64-channel stem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawLayerSpec", into = "RawLayerSpec")]
pub enum LayerSpec {
    /// Quantized conv block with this many output channels.
    Conv(usize),
    /// 2x2 max pooling with stride 2.
    MaxPool,
    /// Full-precision conv block with this many output channels.
    FullPrecisionConv(usize),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawLayerSpec {
    Channels(usize),
    Marker(String),
}

impl TryFrom<RawLayerSpec> for LayerSpec {
    type Error = String;

    fn try_from(raw: RawLayerSpec) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawLayerSpec::Channels(c) => Ok(Self::Conv(c)),
            RawLayerSpec::Marker(m) => match m.as_str() {
                "M" => Ok(Self::MaxPool),
                "F" => Ok(Self::FullPrecisionConv(FULL_PRECISION_STEM_CHANNELS)),
                other => Err(format!("unknown layer marker {other:?} (expected \"M\" or \"F\")")),
            },
        }
    }
}

impl From<LayerSpec> for RawLayerSpec {
    fn from(spec: LayerSpec) -> Self {
        match spec {
            LayerSpec::Conv(c) => Self::Channels(c),
            LayerSpec::MaxPool => Self::Marker("M".to_string()),
            LayerSpec::FullPrecisionConv(_) => Self::Marker("F".to_string()),
        }
    }
}

/// Configuration of the quantized VGG classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VggConfig {
    /// Bit-width selector.
    pub variant: QuantVariant,

    /// Ordered topology table.
    pub layers: Vec<LayerSpec>,

    /// Channels of the input image.
    pub in_channels: usize,

    /// Number of output classes.
    pub num_classes: usize,

    /// Epsilon of the batch-norm layers.
    pub bn_eps: f64,

    /// Template for every quantized conv. Its `bits` is overridden by `variant`.
    pub conv: QuantConvConfig,
}

impl VggConfig {
    /// Create a configuration for a variant with its VGG16 table.
    #[must_use]
    pub fn new(variant: QuantVariant) -> Self {
        Self {
            variant,
            layers: variant.vgg16_layers(),
            in_channels: 3,
            num_classes: 10,
            bn_eps: 1e-5,
            conv: QuantConvConfig::new(variant.bits()),
        }
    }

    /// VGG16 with 4-bit quantized convolutions.
    #[must_use]
    pub fn vgg16_quant_4b() -> Self {
        Self::new(QuantVariant::FourBit)
    }

    /// VGG16 with 2-bit quantized convolutions.
    #[must_use]
    pub fn vgg16_quant_2b() -> Self {
        Self::new(QuantVariant::TwoBit)
    }

    /// Set the number of output classes.
    #[must_use]
    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }

    /// Replace the topology table.
    #[must_use]
    pub fn with_layers(mut self, layers: Vec<LayerSpec>) -> Self {
        self.layers = layers;
        self
    }

    /// Set the number of input channels.
    #[must_use]
    pub fn with_in_channels(mut self, in_channels: usize) -> Self {
        self.in_channels = in_channels;
        self
    }

    /// Replace the conv template. The variant still decides the bit-width.
    #[must_use]
    pub fn with_conv(mut self, conv: QuantConvConfig) -> Self {
        self.conv = conv;
        self
    }

    /// Conv configuration with the variant's bit-width applied.
    #[must_use]
    pub fn conv_config(&self) -> QuantConvConfig {
        self.conv.clone().with_bits(self.variant.bits())
    }

    /// Channels leaving the last conv block, i.e. the classifier input width.
    #[must_use]
    pub fn feature_channels(&self) -> usize {
        self.layers
            .iter()
            .fold(self.in_channels, |channels, spec| match spec {
                LayerSpec::Conv(c) | LayerSpec::FullPrecisionConv(c) => *c,
                LayerSpec::MaxPool => channels,
            })
    }

    /// Number of max-pool entries, i.e. how often the spatial size halves.
    #[must_use]
    pub fn num_pools(&self) -> usize {
        self.layers
            .iter()
            .filter(|s| matches!(s, LayerSpec::MaxPool))
            .count()
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        self.conv_config().validate()?;

        if self.in_channels == 0 {
            return Err(VggQuantError::invalid_config("in_channels must be > 0"));
        }

        if self.num_classes == 0 {
            return Err(VggQuantError::invalid_config("num_classes must be > 0"));
        }

        if self.bn_eps <= 0.0 {
            return Err(VggQuantError::invalid_config("bn_eps must be > 0"));
        }

        let mut has_conv = false;
        for (i, spec) in self.layers.iter().enumerate() {
            match spec {
                LayerSpec::Conv(0) | LayerSpec::FullPrecisionConv(0) => {
                    return Err(VggQuantError::InvalidConfig(format!(
                        "layer {i} has zero output channels"
                    )));
                }
                LayerSpec::Conv(_) | LayerSpec::FullPrecisionConv(_) => has_conv = true,
                LayerSpec::MaxPool => {}
            }
        }

        if !has_conv {
            return Err(VggQuantError::invalid_config(
                "layers must contain at least one conv block",
            ));
        }

        Ok(())
    }

    /// Parse a configuration from JSON.
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or the configuration is invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
