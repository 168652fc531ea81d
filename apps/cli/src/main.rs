//! DesignLens CLI: staged synthesis of qualitative research.
//!
//! Turns interview notes and observations into chunks, inferences,
//! patterns, insights, and design principles.

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
