//! webindex CLI: register, crawl, and index web content per organization.
//!
//! Items are stored in a local libSQL database and moved through the
//! claim-and-process pipeline either in-process (`step`) or by a queue
//! worker (`worker`).

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
