//! Rankforge CLI: operator front-end for training sessions.
//!
//! Sessions and checkpoints live in the configured data directory, so a
//! paused run can be resumed by a later invocation.

mod commands;
mod console;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Rankforge: parameter-efficient training sessions from the terminal
#[derive(Parser, Debug)]
#[command(name = "rankforge", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Override the session data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Create a session and train it on a synthetic corpus
    Run(RunArgs),
    /// Continue a paused session
    Resume {
        /// Session id
        id: String,
        #[command(flatten)]
        corpus: CorpusArgs,
    },
    /// List sessions
    List,
    /// Show one session as JSON
    Show {
        /// Session id
        id: String,
    },
    /// List a session's checkpoints
    Checkpoints {
        /// Session id
        id: String,
    },
    /// Record a checkpoint of a session's latest state
    Checkpoint {
        /// Session id
        id: String,
        /// Free-form description
        #[arg(short, long, default_value = "manual")]
        description: String,
    },
    /// Rewind a paused session to a checkpoint
    Restore {
        /// Session id
        id: String,
        /// Checkpoint id
        checkpoint: String,
    },
    /// Delete a session and its checkpoints
    Delete {
        /// Session id
        id: String,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Session name
    #[arg(short, long, default_value = "session")]
    name: String,

    /// Model configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Adapter type: dora, quantized_rank, sequence_classifier
    #[arg(short = 't', long)]
    model_type: Option<String>,

    /// Decomposition rank (dora)
    #[arg(long, default_value_t = 8)]
    rank: usize,

    /// Target module substrings (dora, quantized_rank)
    #[arg(long, value_delimiter = ',', default_value = "q_proj,v_proj")]
    targets: Vec<String>,

    /// Quantization mode: nf4, int8, fp16 (quantized_rank)
    #[arg(long, default_value = "nf4")]
    quantization: String,

    /// Compression ratio in (0, 1] (quantized_rank)
    #[arg(long, default_value_t = 0.5)]
    compression_ratio: f32,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f32>,

    /// Seed for adapter initialization
    #[arg(long)]
    seed: Option<u64>,

    /// Texts to classify after a classifier run completes
    #[arg(long = "classify")]
    classify: Vec<String>,

    #[command(flatten)]
    corpus: CorpusArgs,
}

/// Shape of the synthetic base model and corpus.
#[derive(clap::Args, Debug, Clone)]
struct CorpusArgs {
    /// Training samples
    #[arg(long, default_value_t = 256)]
    samples: usize,

    /// Validation samples (0 disables validation)
    #[arg(long, default_value_t = 64)]
    validation_samples: usize,

    /// Hidden width of the synthetic base model
    #[arg(long, default_value_t = 32)]
    hidden: usize,

    /// Transformer blocks in the synthetic base model
    #[arg(long, default_value_t = 2)]
    blocks: usize,

    /// Seed for the synthetic model and corpus
    #[arg(long, default_value_t = 42)]
    data_seed: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let mut config = rankforge_core::config::load_config(Some(&workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    if let Some(data_dir) = &cli.data_dir {
        config.storage.data_dir = data_dir.clone();
    }
    if config.storage.data_dir.is_relative() {
        config.storage.data_dir = workspace.join(&config.storage.data_dir);
    }

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = config.storage.data_dir.join("logs");
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "rankforge.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let problems = config.validate();
    if !problems.is_empty() {
        anyhow::bail!("Invalid configuration:\n  {}", problems.join("\n  "));
    }

    commands::handle_command(cli.command, config, cli.quiet).await
}
