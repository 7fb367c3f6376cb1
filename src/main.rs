use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use placement::batch::BatchRunner;
use placement::jobs::{self, EditJob};
use placement::pipelines::{EditPipeline, EditSettings, Fp16Mode, Fp32Mode, PipelineMode};
use placement::schedulers::{Euler, EulerAncestral, NoiseSchedule};
use placement::{ort, Checkpoint, CheckpointPaths, Device, DeviceConfig, DeviceId, ModelConfig};
use rand::Rng;
use tracing_subscriber::EnvFilter;

/// Places objects into background images with an instruction-editing diffusion model.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// CSV job table with bg_image_path, object_to_add and filename columns.
    #[arg(long, alias = "data_path", value_name = "FILE")]
    data_path: PathBuf,

    #[arg(long, alias = "output_dir", value_name = "DIR")]
    output_dir: PathBuf,

    /// Square resolution backgrounds are resized to, a multiple of 64.
    #[arg(long, default_value_t = 512)]
    resolution: u32,

    #[arg(long, default_value_t = 100)]
    steps: usize,

    #[arg(long, value_name = "FILE", default_value = "configs/generate.json")]
    config: PathBuf,

    #[arg(long, value_name = "DIR", default_value = "checkpoints/hive_rw_label")]
    ckpt: PathBuf,

    /// Directory with a replacement VAE encoder and decoder.
    #[arg(long, value_name = "DIR")]
    vae_ckpt: Option<PathBuf>,

    /// Guidance towards the instruction. Both guidance scales accept negative values.
    #[arg(long, default_value_t = 7.5, allow_negative_numbers = true)]
    cfg_text: f32,

    #[arg(long, default_value_t = 1.5, allow_negative_numbers = true)]
    cfg_image: f32,

    /// The random seed shared by every job, drawn at random when unset.
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, value_enum, default_value = "euler-ancestral")]
    sampler: Sampler,

    #[arg(long, value_enum, default_value = "cpu")]
    device: DeviceKind,

    #[arg(long, default_value_t = 0)]
    device_id: i32,

    /// Feed the graphs fp16 tensors, for checkpoints exported in half precision.
    #[arg(long)]
    fp16: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Sampler {
    EulerAncestral,
    Euler,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DeviceKind {
    Cpu,
    Cuda,
    Tensorrt,
    Directml,
    Rocm,
}

impl Args {
    const RESOLUTION_MULTIPLE: u32 = 64;
    const MAX_RANDOM_SEED: u64 = 100_000;

    fn validate(&self) -> Result<()> {
        if self.resolution == 0 || self.resolution % Self::RESOLUTION_MULTIPLE != 0 {
            bail!(
                "resolution must be a positive multiple of {}, got {}",
                Self::RESOLUTION_MULTIPLE,
                self.resolution
            );
        }
        if self.steps == 0 {
            bail!("steps must be at least 1");
        }
        Ok(())
    }

    fn device(&self) -> Device {
        let id = DeviceId::new(self.device_id);
        match self.device {
            DeviceKind::Cpu => Device::Cpu,
            DeviceKind::Cuda => Device::Cuda(id),
            DeviceKind::Tensorrt => Device::TensorRt(id),
            DeviceKind::Directml => Device::DirectMl(id),
            DeviceKind::Rocm => Device::RocM(id),
        }
    }

    fn checkpoint_paths(&self) -> CheckpointPaths {
        let paths = CheckpointPaths::new(&self.ckpt);
        match &self.vae_ckpt {
            Some(vae) => paths.with_vae(vae),
            None => paths,
        }
    }

    fn seed(&self) -> u64 {
        self.seed
            .unwrap_or_else(|| rand::thread_rng().gen_range(0..=Self::MAX_RANDOM_SEED))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    args.validate()?;

    let config = ModelConfig::open(&args.config)
        .with_context(|| format!("loading model config {}", args.config.display()))?;
    let jobs = jobs::load_jobs(&args.data_path)
        .with_context(|| format!("loading jobs from {}", args.data_path.display()))?;
    let seed = args.seed();
    tracing::info!(jobs = jobs.len(), seed, steps = args.steps, "starting batch");

    if args.fp16 {
        run::<Fp16Mode>(&args, &config, &jobs, seed)
    } else {
        run::<Fp32Mode>(&args, &config, &jobs, seed)
    }
}

fn run<Mode: PipelineMode>(
    args: &Args,
    config: &ModelConfig,
    jobs: &[EditJob],
    seed: u64,
) -> Result<()> {
    let env = Arc::new(
        ort::Environment::builder()
            .with_name("placement")
            .with_log_level(ort::LoggingLevel::Warning)
            .build()?,
    );
    let checkpoint = Checkpoint::<Mode>::load(
        env,
        &DeviceConfig::uniform(args.device()),
        &args.checkpoint_paths(),
        config,
    )
    .with_context(|| format!("loading checkpoint {}", args.ckpt.display()))?;

    let settings = EditSettings::default()
        .with_steps(args.steps)
        .with_seed(seed)
        .with_text_guidance(args.cfg_text)
        .with_image_guidance(args.cfg_image);
    let pipeline = EditPipeline::new(&checkpoint, NoiseSchedule::from_config(config)?, settings)?;
    let runner = BatchRunner::new(&pipeline, &args.output_dir, args.resolution)
        .with_instruction(|object| config.instruction(object));

    let written = match args.sampler {
        Sampler::EulerAncestral => runner.run(&mut EulerAncestral, jobs)?,
        Sampler::Euler => runner.run(&mut Euler, jobs)?,
    };
    tracing::info!(images = written.len(), "done");
    Ok(())
}
