//! Build a quantized VGG16, run a forward pass and print its quantization state.
//!
//! Run with: `cargo run --example show_params -- --bits 2 --batch 4`

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use vgg_quant::{QuantVariant, VggConfig, VggQuant};

#[derive(Parser)]
#[command(name = "show_params")]
#[command(about = "Inspect the quantized layers of a VGG16 model")]
struct Args {
    /// Bit-width of the quantized convolutions (2 or 4)
    #[arg(short = 'b', long, default_value = "4")]
    bits: u8,

    /// Batch size of the random input
    #[arg(long, default_value = "2")]
    batch: usize,

    /// Image height and width
    #[arg(long, default_value = "32")]
    size: usize,

    /// Number of classes
    #[arg(long, default_value = "10")]
    num_classes: usize,

    /// Load the model configuration from a JSON file instead
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Print stages and reports as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("vgg_quant=debug".parse()?),
        )
        .init();

    let config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            VggConfig::from_json(&json)?
        }
        None => VggConfig::new(QuantVariant::from_bits(args.bits)?)
            .with_num_classes(args.num_classes),
    };

    let device = Device::Cpu;
    let varmap = VarMap::new();
    let model = VggQuant::new(&config, VarBuilder::from_varmap(&varmap, DType::F32, &device))?;

    let stages = model.stages();
    if !args.json {
        println!("{}: {} stages", config.variant, stages.len());
        for stage in &stages {
            println!("  {stage:?}");
        }
    }

    let images = Tensor::randn(
        0.0f32,
        1.0,
        (args.batch, config.in_channels, args.size, args.size),
        &device,
    )?;
    let scores = model.forward_t(&images, false)?;

    let params = model.show_params()?;
    if args.json {
        let report = serde_json::json!({
            "variant": config.variant.name(),
            "scores": scores.dims(),
            "stages": stages,
            "params": params,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("\nscores: {:?}\n", scores.dims());
        for p in &params {
            println!("{p}");
        }
    }

    Ok(())
}
