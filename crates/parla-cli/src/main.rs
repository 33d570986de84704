mod record;
mod service;

use anyhow::Result;
use clap::{Parser, Subcommand};
use parla_core::{LocalModel, ProviderKind, Settings};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "parla", version, about = "Push-to-talk transcription")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Hold a global shortcut to record, release to transcribe (default)
    Record {
        /// Push-to-talk shortcut, e.g. "ctrl+alt+Space"
        #[arg(long, default_value = "ctrl+alt+Space")]
        shortcut: String,
        /// Override the configured provider for this run
        #[arg(long)]
        provider: Option<ProviderKind>,
    },
    /// Manage the local container-hosted model service
    Service {
        #[command(subcommand)]
        command: ServiceCommand,
    },
}

#[derive(Subcommand)]
pub(crate) enum ServiceCommand {
    /// Show the current service status
    Status,
    /// Download the image and model weights
    Prepare,
    /// Start the service container and wait until it is healthy
    Start,
    /// Stop the service container
    Stop,
    /// Switch the hosted model (stops the previous container first)
    Switch { model: LocalModel },
    /// Clear an error state
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let settings = Settings::load();

    match cli.command {
        None => {
            record::run(settings, "ctrl+alt+Space".to_string(), None).await
        }
        Some(Command::Record { shortcut, provider }) => {
            record::run(settings, shortcut, provider).await
        }
        Some(Command::Service { command }) => service::run(settings, command).await,
    }
}
