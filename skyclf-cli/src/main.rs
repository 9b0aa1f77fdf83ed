//! SkyClf CLI — inspect model exports, classify images and drive training runs.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// SkyClf: sky-state classifier model lifecycle
#[derive(Parser, Debug)]
#[command(name = "skyclf", version, about, long_about = None)]
struct Cli {
    /// Configuration file path (defaults to ./skyclf.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Inspect the effective configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Inspect exported model versions
    Models {
        #[command(subcommand)]
        action: ModelsAction,
    },
    /// Classify one image with the latest (or a pinned) model
    Predict {
        /// Image file (jpeg, png or webp)
        image: PathBuf,
        /// Model version to use instead of the latest
        #[arg(long)]
        version: Option<String>,
    },
    /// Drive the training container
    Train {
        #[command(subcommand)]
        action: TrainAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Print the merged configuration as TOML
    Show,
    /// Write a default skyclf.toml in the current directory
    Init,
}

#[derive(clap::Subcommand, Debug)]
enum ModelsAction {
    /// List version directories, newest first
    List,
    /// Show the resolved model (latest unless --version is given)
    Show {
        #[arg(long)]
        version: Option<String>,
    },
}

#[derive(clap::Args, Debug, Clone)]
struct TrainArgs {
    #[arg(long, default_value_t = 10)]
    epochs: u32,
    #[arg(long = "batch", default_value_t = 16)]
    batch_size: u32,
    #[arg(long, default_value_t = 0.001)]
    lr: f64,
    #[arg(long = "img", default_value_t = 224)]
    img_size: u32,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long = "val", default_value_t = 0.2)]
    val_split: f64,
    /// Ignore the latest export and train from scratch
    #[arg(long)]
    from_scratch: bool,
}

#[derive(clap::Subcommand, Debug)]
enum TrainAction {
    /// Start a training run and follow it until the idle container is back
    Start {
        #[command(flatten)]
        args: TrainArgs,
        /// Return right after launch instead of following the run
        #[arg(long)]
        detach: bool,
    },
    /// Stop the running training container
    Stop,
    /// Print training status as JSON
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let config = skyclf_core::load_config(cli.config.as_deref(), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let filter = match cli.verbose {
        0 if cli.quiet => "error".to_string(),
        0 => config.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };

    // Human-readable layer for stderr
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer for structured logging
    let log_dir = config.log_dir();
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "skyclf.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    commands::handle_command(cli.command, &config).await
}
