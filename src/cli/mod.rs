use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::config::AppSettings;
use crate::state::AppState;
use crate::{gateway, worker};

#[derive(Parser)]
#[command(
    name = "keygate",
    version,
    about = "Multi-provider LLM gateway with health-aware API key rotation"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway front-end
    Serve {
        /// Path to a JSON config file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the configured bind address
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run a background worker processing queued runs
    Worker {
        /// Path to a JSON config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config, bind } => {
            let mut settings = AppSettings::load(config.as_deref())?;
            if let Some(bind) = bind {
                settings.bind_addr = bind;
            }
            let state = AppState::init(settings)?;
            gateway::serve(state).await
        }
        Command::Worker { config } => {
            let settings = AppSettings::load(config.as_deref())?;
            let state = AppState::init(settings)?;
            tokio::select! {
                () = worker::run_worker_loop(state) => Ok(()),
                result = tokio::signal::ctrl_c() => {
                    result?;
                    info!("worker shutting down");
                    Ok(())
                }
            }
        }
    }
}
