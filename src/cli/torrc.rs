//! Torrc command - print the generated torrc

use super::TorrcArgs;
use crate::config;
use crate::tor::torrc;
use anyhow::Result;

/// Run the torrc command
pub async fn run_torrc(args: &TorrcArgs) -> Result<()> {
    let config = config::load_from_path(&args.config)?;
    print!("{}", torrc::generate(&config.tor));
    Ok(())
}
