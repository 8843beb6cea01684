//! Tenant pool manager - pre-provisioned tenant environments on demand.

mod account;
mod cli;
mod commands;
mod coord;
mod pool;
mod provision;
mod types;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Controlled by RUST_LOG, e.g. RUST_LOG=info
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    cli.command.execute().await
}
