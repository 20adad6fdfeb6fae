//! Tandem - agent session orchestrator
//!
//! - `tandem serve`: talk JSON-RPC with the host editor on stdin/stdout
//! - `tandem worker`: one killable agent run, spawned by `serve`

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tandem_core::config::OrchestratorConfig;
use tandem_core::{paths, server, worker};

/// Tandem - agent sessions for your editor
#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Agent session orchestrator for editor-embedded coding assistants", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the host editor over stdin/stdout (default)
    ///
    /// Reads ~/.tandem/config.toml; TANDEM_MODEL, TANDEM_API_KEY and
    /// TANDEM_BASE_URL override it.
    Serve {
        /// Config file to load instead of ~/.tandem/config.toml
        #[arg(short, long)]
        config: Option<std::path::PathBuf>,
    },

    /// Run agent loops for a parent orchestrator over stdin/stdout
    #[command(hide = true)]
    Worker,
}

fn env_filter() -> EnvFilter {
    EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
}

/// stdout carries RPC, so the orchestrator logs to a file
fn init_file_logging() {
    let log_dir = paths::logs_dir();
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Failed to create log directory: {}", e);
    }

    match std::fs::File::create(log_dir.join("tandem.log")) {
        Ok(file) => tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init(),
        Err(e) => {
            eprintln!("Failed to create log file: {}, logging to stderr", e);
            init_stderr_logging();
        }
    }
}

fn init_stderr_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve { config: None }) {
        Commands::Serve { config } => {
            init_file_logging();
            let config = match config {
                Some(path) => {
                    let mut config = OrchestratorConfig::load_from_path(&path)
                        .with_context(|| format!("failed to load {}", path.display()))?;
                    config.apply_env(|key| std::env::var(key).ok());
                    config
                }
                None => OrchestratorConfig::load().context("failed to load configuration")?,
            };
            tracing::info!("Starting tandem v{}", env!("CARGO_PKG_VERSION"));
            server::serve_stdio(config).await?;
        }
        Commands::Worker => {
            init_stderr_logging();
            tracing::debug!("Worker started");
            worker::run_stdio().await?;
        }
    }

    Ok(())
}
