//! NeuraMemory CLI: long-term conversational memory from the command line.
//!
//! Classifies user messages, files them as structured facts, and recalls
//! them by meaning.

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
