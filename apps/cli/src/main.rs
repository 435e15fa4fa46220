//! Curricula CLI: verified curricula and grounded lesson content.
//!
//! Resolves a request to an official curriculum, builds a verified replica
//! on a vault miss, and generates content that cites it.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
