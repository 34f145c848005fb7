use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use warmpool::config::Settings;
use warmpool::metrics::LogMetrics;
use warmpool::provider;
use warmpool::store::MemoryStore;
use warmpool::supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "warmpool", about = "Warm VM pool daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pool daemon.
    Run {
        /// Path to the JSON settings file.
        #[arg(short, long)]
        config: PathBuf,
        /// Compute backend to drive.
        #[arg(long, default_value = "stub")]
        provider: String,
    },
    /// Validate a settings file and exit.
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warmpool=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config, provider: backend } => {
            let Some(settings) = load(&config) else {
                return ExitCode::FAILURE;
            };
            let provider = match provider::from_name(&backend) {
                Ok(provider) => provider,
                Err(e) => {
                    tracing::error!(backend = %backend, error = %e, "cannot build provider");
                    return ExitCode::FAILURE;
                }
            };

            let store = Arc::new(MemoryStore::new());
            let supervisor = Supervisor::new(settings, store, provider, Arc::new(LogMetrics));

            let token = CancellationToken::new();
            let signal_token = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown requested");
                    signal_token.cancel();
                }
            });

            supervisor.run(token).await;
            ExitCode::SUCCESS
        }
        Commands::Check { config } => match load(&config) {
            Some(settings) => {
                println!("ok: {} pool(s) configured", settings.pools.len());
                ExitCode::SUCCESS
            }
            None => ExitCode::FAILURE,
        },
    }
}

fn load(path: &Path) -> Option<Settings> {
    let settings = match Settings::load(path) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "cannot load settings");
            return None;
        }
    };
    if let Err(e) = settings.validate() {
        tracing::error!(error = %e, "invalid settings");
        return None;
    }
    Some(settings)
}
