mod cmd;
mod config;
mod error;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use config::{Cli, Commands};

const DEFAULT_LOG_FILTER: &str = "info,tally_engine=info,tally_api_server=info";

fn startup_banner() -> String {
    format!(
        "tally-server v{} (daily statistics log)",
        env!("CARGO_PKG_VERSION")
    )
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "{}", startup_banner());

    let result = match cli.command {
        Commands::Serve(args) => cmd::serve::run(args).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "tally-server failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
