use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use invgan_data::{ImageFolder, ImageSource};
use invgan_train::render::TILES_PER_ROW;
use invgan_train::{
    sample_noise, save_grid, NullMetricsSink, PenaltyTarget, TorchDevice, TrainConfig,
    TrainingSession,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "invgan")]
#[command(about = "Train a WGAN-GP generator, critic and inverter on an image folder")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train (resuming from the latest checkpoint in the workdir if present)
    Train {
        /// Directory of PNG/JPEG training images
        #[arg(short, long)]
        data: PathBuf,
        /// Directory receiving checkpoints, images, models and metrics
        #[arg(short, long)]
        workdir: Option<PathBuf>,
        /// JSON config file; flags below override it
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        /// Network the gradient penalty trains: critic or generator
        #[arg(long)]
        penalty_target: Option<String>,
        /// cpu, cuda, cuda:N or auto
        #[arg(long, default_value = "auto")]
        device: String,
    },

    /// Restore the latest checkpoint and export all three networks
    Export {
        #[arg(short, long)]
        workdir: Option<PathBuf>,
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = "auto")]
        device: String,
    },

    /// Render samples from the latest generator checkpoint
    Sample {
        #[arg(short, long)]
        workdir: Option<PathBuf>,
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long, default_value = "16")]
        count: usize,
        #[arg(long, default_value = "0")]
        seed: u64,
        #[arg(short, long, default_value = "samples.png")]
        output: PathBuf,
        #[arg(long, default_value = "auto")]
        device: String,
    },

    /// List retained checkpoints
    Checkpoints {
        #[arg(short, long)]
        workdir: Option<PathBuf>,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Write the default configuration as JSON
    InitConfig {
        #[arg(short, long, default_value = "invgan.json")]
        output: PathBuf,
    },
}

fn load_config(path: Option<&Path>, workdir: Option<PathBuf>) -> Result<TrainConfig> {
    let mut config = match path {
        Some(p) => TrainConfig::from_json(p).with_context(|| format!("loading {:?}", p))?,
        None => TrainConfig::default(),
    };
    if let Some(dir) = workdir {
        config.workdir = dir;
    }
    Ok(config)
}

fn parse_penalty_target(s: &str) -> Result<PenaltyTarget> {
    match s.to_ascii_lowercase().as_str() {
        "critic" => Ok(PenaltyTarget::Critic),
        "generator" => Ok(PenaltyTarget::Generator),
        other => bail!("Unknown penalty target `{}` (expected critic or generator)", other),
    }
}

/// Open a session for inspection; metrics are not recorded
fn open_session(config: TrainConfig, device: &str) -> Result<TrainingSession> {
    let device = device.parse::<TorchDevice>()?.resolve()?;
    let session = TrainingSession::open_with_metrics(config, device, Box::new(NullMetricsSink))?;
    if session.restored_from().is_none() {
        tracing::warn!("No checkpoint in {:?}, using freshly initialised networks", session.config().checkpoint_dir());
    }
    Ok(session)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    tracing::info!("invgan started (pid {})", std::process::id());

    match cli.command {
        Commands::Train {
            data,
            workdir,
            config,
            epochs,
            batch_size,
            seed,
            penalty_target,
            device,
        } => {
            let mut config = load_config(config.as_deref(), workdir)?;
            if let Some(n) = epochs {
                config.epochs = n;
            }
            if let Some(n) = batch_size {
                config.batch_size = n;
            }
            if let Some(s) = seed {
                config.seed = s;
            }
            if let Some(target) = penalty_target {
                config.penalty_target = parse_penalty_target(&target)?;
            }
            config.validate()?;

            std::fs::create_dir_all(&config.workdir)?;
            config.to_json(&config.workdir.join("config.json"))?;

            let source: Arc<dyn ImageSource> = Arc::new(ImageFolder::open(&data, config.image_size)?);
            let device = device.parse::<TorchDevice>()?;
            let summary = invgan_train::train(config, device, source)?;

            println!(
                "Trained {} epochs ({} steps, {} skipped batches) in {:.1}s",
                summary.epochs_run,
                summary.steps_applied,
                summary.skipped_batches,
                summary.elapsed.as_secs_f64()
            );
            if let Some(last) = summary.last {
                println!(
                    "Final losses: gen={:.4} disc={:.4} inv={:.4} gp={:.4}",
                    last.gen_loss, last.disc_loss, last.inv_loss, last.gradient_penalty
                );
            }
        }

        Commands::Export { workdir, config, device } => {
            let config = load_config(config.as_deref(), workdir)?;
            let session = open_session(config, &device)?;
            for model in session.export_models()? {
                println!("{:?} + {:?}", model.weights, model.description);
            }
            session.close()?;
        }

        Commands::Sample { workdir, config, count, seed, output, device } => {
            let config = load_config(config.as_deref(), workdir)?;
            let z_dim = config.z_dim;
            let session = open_session(config, &device)?;

            let noise = sample_noise(&mut StdRng::seed_from_u64(seed), count, z_dim);
            let images = session.generate(&noise)?;
            save_grid(&images, &output, TILES_PER_ROW)?;
            println!("Wrote {} samples (step {}) -> {:?}", count, session.step(), output);
            session.close()?;
        }

        Commands::Checkpoints { workdir, config } => {
            let config = load_config(config.as_deref(), workdir)?;
            let dir = config.checkpoint_dir();
            let store = invgan_train::CheckpointStore::open(&dir, config.keep_checkpoints)?;
            if store.manifest().is_empty() {
                println!("No checkpoints in {:?}", dir);
            }
            for entry in &store.manifest().checkpoints {
                println!(
                    "{}  step={:<8} epoch={:<4} {}",
                    entry.file_name,
                    entry.step,
                    entry.epoch,
                    entry.created_at.to_rfc3339()
                );
            }
        }

        Commands::InitConfig { output } => {
            TrainConfig::default().to_json(&output)?;
            println!("Wrote default config -> {:?}", output);
        }
    }

    Ok(())
}
