#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use clap::{Parser, ValueEnum};

use candle::{DType, IndexOp, Tensor, D};
use candle_nn::{ModuleT, VarBuilder, VarMap};
use candle_replknet::{Config, RepLKNet};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Which {
    B31,
    L31,
    Xl,
}

impl Which {
    fn config(&self) -> Config {
        match self {
            Self::B31 => Config::replknet_31b(),
            Self::L31 => Config::replknet_31l(),
            Self::Xl => Config::replknet_xl(),
        }
    }
}

#[derive(Parser)]
struct Args {
    /// Path to a safetensors checkpoint; random weights are used when absent.
    #[arg(long)]
    weights: Option<String>,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    #[arg(value_enum, long, default_value_t = Which::B31)]
    which: Which,
}

fn max_divergence(a: &Tensor, b: &Tensor) -> candle::Result<f32> {
    let diff = (a - b)?.abs()?.flatten_all()?.to_vec1::<f32>()?;
    Ok(diff.into_iter().fold(0f32, f32::max))
}

pub fn main() -> anyhow::Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let args = Args::parse();
    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        None
    };

    let device = candle_replknet_examples::device(args.cpu)?;
    let varmap = VarMap::new();
    let vb = match &args.weights {
        Some(weights) => unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)?
        },
        None => {
            println!("no --weights given, using random initialization");
            VarBuilder::from_varmap(&varmap, DType::F32, &device)
        }
    };

    let mut model = RepLKNet::new(&args.which.config(), vb)?;
    println!("model built");

    let image = Tensor::randn(0f32, 1f32, (1, 3, 224, 224), &device)?;
    let logits = model.forward_t(&image, false)?;
    let prs = candle_nn::ops::softmax(&logits, D::Minus1)?
        .i(0)?
        .to_vec1::<f32>()?;
    let mut prs = prs.iter().enumerate().collect::<Vec<_>>();
    prs.sort_by(|(_, p1), (_, p2)| p2.total_cmp(p1));
    for &(category_idx, pr) in prs.iter().take(5) {
        println!("class {category_idx:4}: {:.2}%", 100. * pr);
    }

    model.structural_reparam()?;
    let merged_logits = model.forward_t(&image, false)?;
    println!(
        "max divergence after structural reparameterization: {:.3e}",
        max_divergence(&logits, &merged_logits)?
    );
    Ok(())
}
