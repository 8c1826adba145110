use anyhow::{Context, Result};
use clap::Parser;

mod cli;
mod commands;
mod repl;
mod version;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    cli.init_logging().context("init logging")?;
    commands::dispatch(cli).await
}
