use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use flatten_rs::diffusion::sampler::{ReverseSampler, SamplingMethod};
use flatten_rs::diffusion::types::SeededNoise;
use flatten_rs::pose::PoseLayout;
use flatten_rs::predictor::{MlpPredictor, PredictorConfig};
use flatten_rs::utils::get_device;
use flatten_rs::{diffusion_from_config, DiffusionConfig};
use tch::{nn, Device, Kind, Tensor};
use tracing::info;
use tracing_chrome::ChromeLayerBuilder;
use tracing_subscriber::{prelude::*, EnvFilter};

const DEFAULT_CONFIG: &str = "src/diffusion/config.default.toml";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Write a chrome trace of the run to the working directory.
    #[arg(long)]
    trace: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log the active noise schedule.
    Schedule {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: String,
    },
    /// Sample pose estimates for one set of projected target corners.
    Sample {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: String,

        /// Predictor weights saved from a tch VarStore.
        #[arg(long)]
        weights: String,

        #[arg(long)]
        predictor_config: Option<String>,

        /// The four projected corners, x0 y0 x1 y1 x2 y2 x3 y3.
        #[arg(long, num_args = 8, allow_negative_numbers = true)]
        corners: Vec<f64>,

        #[arg(long, default_value = "9527")]
        seed: u64,

        #[arg(long, default_value = "1")]
        num_samples: i64,

        /// Run DDIM updates with this eta instead of ancestral sampling.
        #[arg(long)]
        ddim_eta: Option<f64>,
    },
}

fn init_tracing(trace: bool) -> Option<tracing_chrome::FlushGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer());
    if trace {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        registry.with(chrome_layer).init();
        Some(guard)
    } else {
        registry.init();
        None
    }
}

fn schedule(config: &str) -> anyhow::Result<()> {
    let config = DiffusionConfig::from_file(config)?;
    let diffusion = diffusion_from_config(&config)?;
    let schedule = diffusion.schedule();
    let ac = schedule.alphas_cumprod();
    info!(
        kind = %config.schedule,
        base_timesteps = config.timesteps,
        active = schedule.len(),
        alpha_bar_first = ac[0],
        alpha_bar_last = ac[ac.len() - 1],
        "schedule"
    );
    if let Some(map) = schedule.timestep_map() {
        info!(?map, "timestep map");
    }
    Ok(())
}

fn sample(
    config: &str,
    weights: &str,
    predictor_config: Option<&str>,
    corners: &[f64],
    seed: u64,
    num_samples: i64,
    ddim_eta: Option<f64>,
) -> anyhow::Result<()> {
    let config = DiffusionConfig::from_file(config)?;
    let diffusion = diffusion_from_config(&config)?;
    let predictor_config = match predictor_config {
        Some(path) => PredictorConfig::from_file(path)?,
        None => PredictorConfig::default(),
    };
    let layout = PoseLayout::default();
    anyhow::ensure!(
        predictor_config.d_input == layout.dim(),
        "predictor estimates {} values, the pose layout has {}",
        predictor_config.d_input,
        layout.dim()
    );

    let device = get_device();
    let mut vs = nn::VarStore::new(device);
    let predictor = MlpPredictor::new(&vs.root(), &predictor_config);
    vs.load(weights).with_context(|| format!("loading predictor weights from {weights}"))?;
    info!(weights, ?device, "loaded predictor");

    let cond = Tensor::from_slice(corners)
        .to_kind(Kind::Float)
        .to_device(device)
        .view([1, -1])
        .repeat([num_samples, 1]);
    let shape = [num_samples, predictor_config.d_input];
    let mut sampler = ReverseSampler::new(&diffusion, &predictor, &shape, &cond, SeededNoise::new(seed))?
        .clip_denoised(config.clip_denoised);
    if let Some(eta) = ddim_eta {
        sampler = sampler.method(SamplingMethod::Ddim { eta });
    }

    let start = Instant::now();
    let samples = sampler.run()?.to_device(Device::Cpu);
    info!(steps = diffusion.num_timesteps(), elapsed = ?start.elapsed(), "sampling done");

    let pose = layout.split(&samples)?;
    for i in 0..num_samples {
        let [origin, size, rotation, translation, post_translation] = pose.row(i)?;
        info!(
            sample = i,
            ?origin,
            ?size,
            ?rotation,
            ?translation,
            ?post_translation,
            "pose estimate"
        );
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = init_tracing(args.trace);
    match args.command {
        Command::Schedule { config } => schedule(&config),
        Command::Sample {
            config,
            weights,
            predictor_config,
            corners,
            seed,
            num_samples,
            ddim_eta,
        } => sample(
            &config,
            &weights,
            predictor_config.as_deref(),
            &corners,
            seed,
            num_samples,
            ddim_eta,
        ),
    }
}
