//! onionwrapper - run a Tor daemon under supervision
//!
//! Starts Tor with a generated torrc, drives it over the control port and
//! publishes ephemeral hidden services.
//!
//! # Usage
//!
//! ```bash
//! # Run until Ctrl-C
//! onionwrapper run --config /etc/onionwrapper.toml
//!
//! # Show the torrc that would be used
//! onionwrapper torrc --config /etc/onionwrapper.toml
//! ```

use anyhow::Result;
use clap::Parser;
use onionwrapper::cli::{self, Cli, Commands};
use onionwrapper::logging;
use tracing::Level;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        logging::init_with_level(Level::DEBUG);
    } else {
        logging::init();
    }

    match &cli.command {
        Commands::Run(args) => {
            cli::run_wrapper(args).await?;
        },
        Commands::Torrc(args) => {
            cli::run_torrc(args).await?;
        },
    }

    Ok(())
}
