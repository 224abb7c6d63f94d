//! Command-line interface for onionwrapper
//!
//! Provides two commands:
//! - `run` - Start Tor, apply the network settings, publish hidden services
//! - `torrc` - Print the torrc that `run` would generate

mod run;
mod torrc;

pub use run::run_wrapper;
pub use torrc::run_torrc;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// onionwrapper - Supervise a Tor daemon and publish hidden services
#[derive(Parser, Debug)]
#[command(name = "onionwrapper")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbose output
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run Tor until interrupted
    Run(RunArgs),

    /// Print the generated torrc
    Torrc(TorrcArgs),
}

/// Arguments for run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to config file
    #[arg(long)]
    pub config: PathBuf,
}

/// Arguments for torrc command
#[derive(Parser, Debug)]
pub struct TorrcArgs {
    /// Path to config file
    #[arg(long)]
    pub config: PathBuf,
}
