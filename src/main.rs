//! vqvc CLI - training and voice conversion from the command line

use anyhow::{bail, Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use vqvc::checkpoint::{CheckpointDiagnostics, CONFIG_FILE, DISCRIMINATOR_FILE, GENERATOR_FILE};
use vqvc::inference::InferenceConfig;
use vqvc::models::Synthesizer;
use vqvc::training::FilelistDataset;
use vqvc::{GanTrainer, ModelConfig, VectorQuantizer, VoiceConverter, VERSION};

/// vqvc - vector-quantized voice conversion in Rust
#[derive(Parser, Debug)]
#[command(name = "vqvc")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use CPU instead of GPU
    #[arg(long, global = true)]
    cpu: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Speak the source utterance with the target speaker
    Convert {
        /// Content embedding of the source utterance (.npy or .safetensors)
        #[arg(short, long)]
        source: PathBuf,

        /// Content embedding of a target-speaker utterance
        #[arg(short, long)]
        target: PathBuf,

        /// Output audio file path
        #[arg(short, long, default_value = "output.wav")]
        output: PathBuf,

        /// Checkpoint directory (config.yaml, generator and codebook)
        #[arg(short, long, default_value = "checkpoints")]
        checkpoint: PathBuf,

        /// Codebook file overriding the checkpoint's
        #[arg(long)]
        codebook: Option<PathBuf>,
    },

    /// Resynthesize an utterance with its own speaker
    Reconstruct {
        /// Content embedding to resynthesize
        #[arg(short, long)]
        input: PathBuf,

        /// Output audio file path
        #[arg(short, long, default_value = "output.wav")]
        output: PathBuf,

        /// Checkpoint directory
        #[arg(short, long, default_value = "checkpoints")]
        checkpoint: PathBuf,
    },

    /// Train generator, codebook and discriminators
    Train {
        /// Path to model config file
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,

        /// Checkpoint directory, written after every epoch
        #[arg(short, long, default_value = "checkpoints")]
        output: PathBuf,

        /// Total number of epochs
        #[arg(short, long, default_value = "100")]
        epochs: usize,

        /// Continue from the checkpoint in the output directory
        #[arg(long)]
        resume: bool,
    },

    /// Convert precomputed centroids (.npy) into a codebook file
    ImportCodebook {
        /// Centroid matrix (codebook_size, embedding_dim)
        #[arg(short, long)]
        input: PathBuf,

        /// Output .safetensors file
        #[arg(short, long, default_value = "codebook.safetensors")]
        output: PathBuf,

        /// Config providing the quantizer settings
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show configuration and checkpoint information
    Info {
        /// Checkpoint directory
        #[arg(short, long, default_value = "checkpoints")]
        checkpoint: PathBuf,
    },
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

fn create_progress_bar(len: u64, msg: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );
    pb.set_message(msg.to_string());
    Ok(pb)
}

fn select_device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else {
        Ok(Device::cuda_if_available(0)?)
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ModelConfig> {
    match path {
        Some(path) => ModelConfig::load(path).context("Failed to load config"),
        None => Ok(ModelConfig::default()),
    }
}

fn train(config_path: PathBuf, output: PathBuf, epochs: usize, resume: bool, cpu: bool) -> Result<()> {
    let config = ModelConfig::load(&config_path).context("Failed to load config")?;
    let device = select_device(cpu)?;
    info!("Training on {:?}", device);

    let Some(training_files) = config.data.training_files.as_ref() else {
        bail!("{:?} has no data.training_files", config_path);
    };
    let dataset = FilelistDataset::open(training_files, &config, &device)?;
    let validation = match config.data.validation_files.as_ref() {
        Some(path) => Some(FilelistDataset::open(path, &config, &device)?),
        None => None,
    };

    let mut trainer = GanTrainer::new(&config, &device)?;
    if resume {
        trainer.load_checkpoint(&output)?;
    }

    let batches_per_epoch = dataset.len().div_ceil(config.train.batch_size.max(1));
    while trainer.state().epoch < epochs {
        let epoch = trainer.state().epoch;
        let pb = create_progress_bar(batches_per_epoch as u64, &format!("epoch {}", epoch))?;
        let summary = trainer.train_epoch(&dataset, |report| {
            pb.set_message(format!(
                "epoch {} | d {:.3} | g {:.3}",
                epoch, report.loss_disc, report.loss_total
            ));
            pb.inc(1);
        })?;
        pb.finish_with_message(format!(
            "epoch {} | d {:.3} | g {:.3} | ppl {:.1}",
            epoch, summary.mean_loss_disc, summary.mean_loss_total, summary.mean_perplexity
        ));
        if summary.skipped_batches > 0 {
            warn!(
                "{} batches had no utterance of at least {} frames",
                summary.skipped_batches, config.train.segment_size
            );
        }

        if let Some(validation) = &validation {
            trainer.evaluate(validation)?;
        }
        trainer.save_checkpoint(&output)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    info!("vqvc v{}", VERSION);

    match cli.command {
        Commands::Convert {
            source,
            target,
            output,
            checkpoint,
            codebook,
        } => {
            let converter = VoiceConverter::with_config(
                &checkpoint,
                InferenceConfig {
                    use_gpu: !cli.cpu,
                    codebook,
                },
            )?;
            let result = converter.convert(&source, &target)?;
            result.save(&output)?;
            info!("Wrote {:?} ({:.2}s)", output, result.duration());
            Ok(())
        }

        Commands::Reconstruct {
            input,
            output,
            checkpoint,
        } => {
            let converter = VoiceConverter::with_config(
                &checkpoint,
                InferenceConfig {
                    use_gpu: !cli.cpu,
                    codebook: None,
                },
            )?;
            let result = converter.reconstruct(&input)?;
            result.save(&output)?;
            info!("Wrote {:?} ({:.2}s)", output, result.duration());
            Ok(())
        }

        Commands::Train {
            config,
            output,
            epochs,
            resume,
        } => train(config, output, epochs, resume, cli.cpu),

        Commands::ImportCodebook {
            input,
            output,
            config,
        } => {
            let config = load_config(config.as_ref())?;
            let quantizer = VectorQuantizer::load_file(&input, &config.quantizer, &Device::Cpu)?;
            if quantizer.embedding_dim() != config.model.ssl_dim {
                warn!(
                    "Codebook rows have {} dims but model.ssl_dim is {}",
                    quantizer.embedding_dim(),
                    config.model.ssl_dim
                );
            }
            quantizer.save(&output)?;
            info!(
                "Wrote {}x{} codebook to {:?}",
                quantizer.num_embeddings(),
                quantizer.embedding_dim(),
                output
            );
            Ok(())
        }

        Commands::Info { checkpoint } => {
            let config_path = checkpoint.join(CONFIG_FILE);
            info!("Loading config from {:?}", config_path);

            if !config_path.exists() {
                eprintln!("Config file not found: {:?}", config_path);
                return Ok(());
            }
            let cfg = ModelConfig::load(&config_path).context("Failed to load config")?;
            println!("{:#?}", cfg);

            let synth = Synthesizer::new(&cfg, &Device::Cpu)?;
            let mut diagnostics = CheckpointDiagnostics::new(cli.verbose);
            let generator_path = checkpoint.join(GENERATOR_FILE);
            if generator_path.exists() {
                diagnostics.inspect(&generator_path, "generator", synth.varmap())?;
            }
            if checkpoint.join(DISCRIMINATOR_FILE).exists() {
                println!("Discriminator checkpoint present");
            }
            println!(
                "Generator tensors: {}, all loaded: {}",
                synth.varmap().all_vars().len(),
                diagnostics.all_loaded()
            );
            Ok(())
        }
    }
}
