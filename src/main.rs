//! CLI entry point for rapport-lm.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rapport_lm::checkpoint::{load_checkpoint, FINAL_CHECKPOINT};
use rapport_lm::data::{render_prompt, write_sample_data};
use rapport_lm::tokenizer::load_encoder;
use rapport_lm::{
    DpoTrainer, Generator, ModelParameters, NoProgress, PreferenceDataset, RapportConfig,
    RapportError, RapportModel, Result, SftDataset, SftTrainer, TextEncoder,
};

#[derive(Parser)]
#[command(name = "rapport")]
#[command(about = "Train and sample a small conversational coaching language model")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: PathBuf,
        /// Model preset (tiny, small, base)
        #[arg(long, default_value = "tiny")]
        preset: String,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: PathBuf,
    },
    /// Write small SFT and preference datasets
    SampleData {
        /// Output directory
        #[arg(default_value = "./data")]
        dir: PathBuf,
    },
    /// Run supervised fine-tuning
    Sft {
        /// Path to configuration file
        config: PathBuf,
        /// Resume from checkpoint
        #[arg(long)]
        resume: Option<PathBuf>,
    },
    /// Run preference optimization on a trained checkpoint
    Dpo {
        /// Path to configuration file
        config: PathBuf,
        /// Starting checkpoint (defaults to the final SFT checkpoint)
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
    /// Decode a reply to a prompt
    Generate {
        /// Path to configuration file
        config: PathBuf,
        /// Prompt text
        prompt: String,
        /// Checkpoint to load (defaults to the final SFT checkpoint)
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Sampler seed
        #[arg(long)]
        seed: Option<u64>,
        /// Override the configured token budget
        #[arg(long)]
        max_new_tokens: Option<usize>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = RapportConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {}", output.display());
        }
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config.display());
            let config = RapportConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!(
                "  Model: {} layers, hidden {}, {} heads, {} parameters",
                config.model.num_layers,
                config.model.hidden_size,
                config.model.num_heads,
                config.model.parameter_count()
            );
            println!("  Dataset: {}", config.dataset.train_path);
            println!("  Output: {}", config.output_dir);
        }
        Commands::SampleData { dir } => {
            let (sft, pref) = write_sample_data(&dir)?;
            println!("✓ Wrote {} and {}", sft.display(), pref.display());
        }
        Commands::Sft { config, resume } => {
            let config = load_config(&config)?;
            let device = config.device()?;
            let encoder = load_encoder(&config.tokenizer)?;
            check_encoder(&config.model, encoder.as_ref())?;

            let max_length = config.model.max_length;
            let train_set = SftDataset::load(&config.dataset.train_path, encoder.as_ref(), max_length)?;
            let eval_set = config
                .dataset
                .eval_path
                .as_ref()
                .map(|path| SftDataset::load(path, encoder.as_ref(), max_length))
                .transpose()?;

            let trainer = match resume {
                Some(checkpoint) => {
                    SftTrainer::resume(checkpoint, config.training.clone(), &config.output_dir, &device)?
                }
                None => SftTrainer::new(
                    RapportModel::new(&config.model, &device)?,
                    config.training.clone(),
                    &config.output_dir,
                )?,
            };
            let mut trainer = trainer.with_seed(config.seed);
            let history = trainer.train(&train_set, eval_set.as_ref(), &mut NoProgress)?;

            println!("✓ SFT finished at step {}", trainer.global_step());
            if let Some(last) = history.last() {
                println!("  Last logged loss: {:.4}", last.loss);
            }
            if let Some(best) = trainer.best_eval_loss() {
                println!("  Best eval loss: {best:.4}");
            }
        }
        Commands::Dpo { config, checkpoint } => {
            let config = load_config(&config)?;
            let device = config.device()?;
            let encoder = load_encoder(&config.tokenizer)?;
            check_encoder(&config.model, encoder.as_ref())?;

            let dataset = PreferenceDataset::load(
                &config.dataset.preference_path,
                encoder.as_ref(),
                config.model.max_length,
            )?;
            let checkpoint = checkpoint.unwrap_or_else(|| Path::new(&config.output_dir).join(FINAL_CHECKPOINT));
            let policy = if checkpoint.is_dir() {
                load_checkpoint(&checkpoint, &device)?.0
            } else {
                tracing::warn!(
                    "No checkpoint at {}; starting DPO from a fresh model",
                    checkpoint.display()
                );
                RapportModel::new(&config.model, &device)?
            };

            let mut trainer =
                DpoTrainer::new(policy, config.dpo.clone(), &config.output_dir)?.with_seed(config.seed);
            let history = trainer.train(&dataset, &mut NoProgress)?;
            println!("✓ DPO finished at step {}", trainer.global_step());
            for record in history {
                println!(
                    "  Epoch {}: loss {:.4}, chosen reward {:.4}, rejected reward {:.4}",
                    record.epoch, record.loss, record.chosen_reward, record.rejected_reward
                );
            }
        }
        Commands::Generate {
            config,
            prompt,
            checkpoint,
            seed,
            max_new_tokens,
        } => {
            let config = load_config(&config)?;
            let device = config.device()?;
            let encoder = load_encoder(&config.tokenizer)?;

            let checkpoint = checkpoint.unwrap_or_else(|| Path::new(&config.output_dir).join(FINAL_CHECKPOINT));
            let (model, _) = load_checkpoint(&checkpoint, &device)?;
            check_encoder(model.params(), encoder.as_ref())?;

            let mut generation = config.generation.clone();
            generation.eos_token_id = Some(encoder.eos_id());
            generation.pad_token_id = Some(encoder.pad_id());
            if let Some(seed) = seed {
                generation.seed = seed;
            }
            if let Some(n) = max_new_tokens {
                generation.max_new_tokens = n;
            }

            let ids = encoder.encode(&render_prompt(&prompt))?;
            let mut generator = Generator::new(&model, generation)?;
            let reply = generator.complete(&ids)?;
            println!("{}", encoder.decode(&reply)?.trim());
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<RapportConfig> {
    tracing::info!("Loading configuration: {}", path.display());
    let config = RapportConfig::from_file(path)?;
    config.validate()?;
    Ok(config)
}

/// The encoder's ids must fit the model and agree on the padding id.
fn check_encoder(params: &ModelParameters, encoder: &dyn TextEncoder) -> Result<()> {
    if encoder.vocab_size() > params.vocab_size {
        return Err(RapportError::config(format!(
            "tokenizer vocabulary ({}) exceeds model vocab_size ({})",
            encoder.vocab_size(),
            params.vocab_size
        )));
    }
    if encoder.pad_id() != params.pad_token_id {
        return Err(RapportError::config(format!(
            "tokenizer pad id {} differs from model pad_token_id {}",
            encoder.pad_id(),
            params.pad_token_id
        )));
    }
    Ok(())
}
