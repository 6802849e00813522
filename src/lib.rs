// Declare the modules
pub mod api;
pub mod classify;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod models;
pub mod router;
pub mod session;
pub mod state;
pub mod storage;

#[cfg(test)]
mod testing;

use anyhow::Context;
use clap::Parser;

pub use error::{ChatError, ChatResult};

/// Entry point of the `phonesim` binary.
pub fn run() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let cli = cli::Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(cli::execute(cli))
}
