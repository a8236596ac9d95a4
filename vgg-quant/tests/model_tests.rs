//! Integration tests for the quantized VGG16 variants.
//!
//! These build the full VGG16 topologies and check the assembled pipeline,
//! end-to-end output shapes and the failure modes of the forward pass.

use candle_core::{DType, Device, Tensor};
use candle_nn::{ModuleT, VarBuilder, VarMap};
use vgg_quant::{
    vgg16_quant_2b, vgg16_quant_4b, LayerSpec, QuantVariant, Stage, VggConfig, VggQuant,
    VggQuantError,
};

fn build(config: &VggConfig) -> (VggQuant, VarMap) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    (VggQuant::new(config, vb).unwrap(), varmap)
}

/// (in, out, followed by batch norm) for every quantized conv.
fn conv_transitions(model: &VggQuant) -> Vec<(usize, usize, bool)> {
    let stages = model.stages();
    stages
        .iter()
        .enumerate()
        .filter_map(|(i, stage)| match stage {
            Stage::QuantConv {
                in_channels,
                out_channels,
                ..
            } => Some((
                *in_channels,
                *out_channels,
                matches!(stages[i + 1], Stage::BatchNorm(_)),
            )),
            _ => None,
        })
        .collect()
}

#[test]
fn test_4b_skips_norm_only_on_8_to_8() {
    let (model, _varmap) = build(&VggConfig::vgg16_quant_4b());
    let transitions = conv_transitions(&model);
    assert_eq!(transitions.len(), 13);

    for (in_c, out_c, has_norm) in transitions {
        let sentinel = in_c == 8 && out_c == 8;
        assert_eq!(has_norm, !sentinel, "{in_c} -> {out_c}");
    }

    // The sentinel conv feeds the activation directly.
    let stages = model.stages();
    let pos = stages
        .iter()
        .position(|s| {
            *s == Stage::QuantConv {
                in_channels: 8,
                out_channels: 8,
                bits: 4,
            }
        })
        .unwrap();
    assert_eq!(stages[pos + 1], Stage::Relu);
}

#[test]
fn test_2b_skips_norm_only_on_16_to_16() {
    let (model, _varmap) = build(&VggConfig::vgg16_quant_2b());
    let transitions = conv_transitions(&model);
    let skipped: Vec<_> = transitions.iter().filter(|t| !t.2).collect();
    assert_eq!(skipped, vec![&(16, 16, false)]);
    assert!(model.quant_convs().all(|c| c.bits() == 2 && c.num_levels() == 4));
}

#[test]
fn test_8_to_8_keeps_norm_in_2b() {
    let config = VggConfig::vgg16_quant_2b().with_layers(vec![
        LayerSpec::Conv(8),
        LayerSpec::Conv(8),
        LayerSpec::MaxPool,
    ]);
    let (model, _varmap) = build(&config);
    assert!(conv_transitions(&model).iter().all(|t| t.2));
}

#[test]
fn test_pipeline_tail() {
    let (model, _varmap) = build(&VggConfig::vgg16_quant_4b());
    let stages = model.stages();
    let n = stages.len();
    assert_eq!(
        stages[n - 4..],
        [
            Stage::MaxPool,
            Stage::AvgPool,
            Stage::Flatten,
            Stage::Linear {
                in_features: 512,
                out_features: 10
            }
        ]
    );
    assert_eq!(
        stages.iter().filter(|s| **s == Stage::MaxPool).count(),
        5
    );
}

#[test]
fn test_4b_end_to_end_shape() {
    let varmap = VarMap::new();
    let model =
        vgg16_quant_4b(VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu)).unwrap();
    let images = Tensor::randn(0.0f32, 1.0, (2, 3, 32, 32), &Device::Cpu).unwrap();

    let scores = model.forward_t(&images, false).unwrap();
    assert_eq!(scores.dims(), &[2, 10]);
}

#[test]
fn test_2b_end_to_end_shape() {
    let varmap = VarMap::new();
    let model =
        vgg16_quant_2b(VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu)).unwrap();
    let images = Tensor::randn(0.0f32, 1.0, (2, 3, 32, 32), &Device::Cpu).unwrap();

    // Through the candle trait as a training loop would call it.
    let scores = ModuleT::forward_t(&model, &images, true).unwrap();
    assert_eq!(scores.dims(), &[2, 10]);
}

#[test]
fn test_custom_head() {
    let (model, _varmap) = build(&VggConfig::vgg16_quant_4b().with_num_classes(100));
    let images = Tensor::randn(0.0f32, 1.0, (1, 3, 32, 32), &Device::Cpu).unwrap();
    let scores = model.forward_t(&images, false).unwrap();
    assert_eq!(scores.dims(), &[1, 100]);
}

#[test]
fn test_channel_mismatch_is_shape_error() {
    let (model, _varmap) = build(&VggConfig::vgg16_quant_4b());
    let images = Tensor::randn(0.0f32, 1.0, (2, 1, 32, 32), &Device::Cpu).unwrap();

    match model.forward_t(&images, false) {
        Err(VggQuantError::ShapeMismatch { expected, actual }) => {
            assert_eq!(expected, vec![2, 3, 32, 32]);
            assert_eq!(actual, vec![2, 1, 32, 32]);
        }
        other => panic!("expected shape mismatch, got {other:?}"),
    }

    // The candle trait boundary reports the same failure.
    let err = ModuleT::forward_t(&model, &images, false).unwrap_err();
    assert!(err.to_string().contains("shape mismatch"));
}

#[test]
fn test_show_params_covers_every_quant_layer() {
    let (model, _varmap) = build(&VggConfig::vgg16_quant_4b());
    let params = model.show_params().unwrap();
    assert_eq!(params.len(), 13);
    assert_eq!((params[0].in_channels, params[0].out_channels), (3, 64));
    assert_eq!((params[8].in_channels, params[8].out_channels), (8, 8));
    assert_eq!((params[12].in_channels, params[12].out_channels), (512, 512));
    assert!(params.iter().all(|p| p.bits == 4 && p.num_levels == 16));
}

#[test]
fn test_training_steps_move_weights_and_keep_forward_working() {
    use candle_nn::{loss, Optimizer, SGD};

    let config = VggConfig::new(QuantVariant::FourBit).with_layers(vec![
        LayerSpec::Conv(8),
        LayerSpec::MaxPool,
        LayerSpec::Conv(8),
        LayerSpec::MaxPool,
    ]);
    let (model, varmap) = build(&config);
    let mut sgd = SGD::new(varmap.all_vars(), 0.1).unwrap();

    let images = Tensor::rand(0.0f32, 20.0, (4, 3, 4, 4), &Device::Cpu).unwrap();
    let labels = Tensor::new(&[0u32, 1, 2, 3], &Device::Cpu).unwrap();

    let first_weight = |model: &VggQuant| -> Vec<f32> {
        model
            .quant_convs()
            .next()
            .unwrap()
            .weight()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap()
    };
    let before = first_weight(&model);

    for step in 0..8 {
        let scores = model
            .forward_t(&images, true)
            .unwrap_or_else(|e| panic!("forward failed at step {step}: {e}"));
        let loss = loss::cross_entropy(&scores, &labels).unwrap();
        assert!(loss.to_scalar::<f32>().unwrap().is_finite(), "step {step}");
        sgd.backward_step(&loss).unwrap();
    }

    assert_ne!(before, first_weight(&model));
    let scores = model.forward_t(&images, false).unwrap();
    assert_eq!(scores.dims(), &[4, 10]);
    for params in model.show_params().unwrap() {
        assert!(params.weight_alpha > 0.0 && params.act_alpha > 0.0);
    }
}
