mod ai_sdk;
mod classifier;
mod client;
mod config;
mod engine;
#[cfg(test)]
mod fakes;
mod graphs;
mod orchestrator;
mod prompts;
mod protocol;
mod server;
mod stream;
mod telemetry;
mod tools;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use config::{Cli, Command};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Serve(args) => server::run(args).await,
        Command::Chat(args) => client::run(args).await,
    }
}
