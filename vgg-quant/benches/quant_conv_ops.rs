//! Benchmarks for quantized convolution operations.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use vgg_quant::{QuantConv2d, Quantizer};

fn bench_quantizer(c: &mut Criterion) {
    let mut group = c.benchmark_group("quantizer");
    let device = Device::Cpu;

    for bits in [2u8, 4] {
        let quantizer = Quantizer::signed(bits).unwrap();
        let weight = Tensor::randn(0.0f32, 1.0, (256, 256, 3, 3), &device).unwrap();
        let alpha = Tensor::new(3.0f32, &device).unwrap();

        group.bench_with_input(BenchmarkId::new("quantize", bits), &bits, |bench, _| {
            bench.iter(|| black_box(quantizer.quantize(&weight, &alpha).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("codes", bits), &bits, |bench, _| {
            bench.iter(|| black_box(quantizer.codes(&weight, 3.0).unwrap()))
        });
    }

    group.finish();
}

fn bench_quant_conv_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("quant_conv_forward");
    let device = Device::Cpu;

    for (channels, size) in [(64, 32), (128, 16), (512, 4)] {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let conv = QuantConv2d::new(channels, channels, 3, 1, 4, vb).unwrap();
        let input = Tensor::randn(0.0f32, 1.0, (8, channels, size, size), &device).unwrap();

        let label = format!("{channels}x{size}x{size}");
        group.bench_with_input(BenchmarkId::new("forward", &label), &(), |bench, _| {
            bench.iter(|| black_box(conv.try_forward(&input).unwrap()))
        });
    }

    group.finish();
}

fn bench_ste_backward(c: &mut Criterion) {
    let mut group = c.benchmark_group("ste_backward");
    let device = Device::Cpu;

    for size in [1024usize, 65_536] {
        let quantizer = Quantizer::unsigned(4).unwrap();
        let x = candle_core::Var::randn(0.0f32, 4.0, size, &device).unwrap();
        let alpha = candle_core::Var::new(8.0f32, &device).unwrap();

        group.bench_with_input(BenchmarkId::new("backward", size), &size, |bench, _| {
            bench.iter(|| {
                let q = quantizer.quantize(x.as_tensor(), alpha.as_tensor()).unwrap();
                black_box(q.sum_all().unwrap().backward().unwrap())
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_quantizer,
    bench_quant_conv_forward,
    bench_ste_backward
);
criterion_main!(benches);
