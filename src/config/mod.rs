//! Configuration loading and validation
//!
//! Handles TOML configuration parsing with strict validation.
//! No runtime mutation - configuration is immutable after load.

pub mod file;
mod validation;

pub use file::load_from_path;
pub use validation::validate;

use serde::Deserialize;
use std::env::consts::EXE_SUFFIX;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub tor: WrapperConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    /// Hidden services published after start
    #[serde(default)]
    pub hidden_service: Vec<HiddenServiceConfig>,
}

/// Where the daemon lives and which ports it listens on
#[derive(Debug, Clone, Deserialize)]
pub struct WrapperConfig {
    /// Working directory; the daemon's HOME and parent of its data directory
    pub directory: PathBuf,
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Tor executable, defaults to `tor` inside the working directory
    pub executable: Option<PathBuf>,
}

fn default_socks_port() -> u16 {
    59050
}
fn default_control_port() -> u16 {
    59051
}

impl WrapperConfig {
    /// Configuration with default ports for the given working directory
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            socks_port: default_socks_port(),
            control_port: default_control_port(),
            executable: None,
        }
    }

    pub fn tor_executable(&self) -> PathBuf {
        self.executable
            .clone()
            .unwrap_or_else(|| self.executable_in_directory("tor"))
    }

    pub fn obfs4_executable(&self) -> PathBuf {
        self.executable_in_directory("obfs4proxy")
    }

    pub fn snowflake_executable(&self) -> PathBuf {
        self.executable_in_directory("snowflake")
    }

    /// Generated torrc
    pub fn config_file(&self) -> PathBuf {
        self.directory.join("torrc")
    }

    /// Tor's DataDirectory
    pub fn data_directory(&self) -> PathBuf {
        self.directory.join(".tor")
    }

    /// Control port auth cookie written by the daemon
    pub fn cookie_file(&self) -> PathBuf {
        self.data_directory().join("control_auth_cookie")
    }

    fn executable_in_directory(&self, basename: &str) -> PathBuf {
        self.directory.join(format!("{}{}", basename, EXE_SUFFIX))
    }
}

/// Network settings applied once the daemon has started
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_enable")]
    pub enable: bool,
    /// Bridge lines in torrc format; empty means no bridges
    #[serde(default)]
    pub bridges: Vec<String>,
    #[serde(default)]
    pub connection_padding: bool,
    #[serde(default)]
    pub ipv6: bool,
}

fn default_enable() -> bool {
    true
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enable: default_enable(),
            bridges: Vec::new(),
            connection_padding: false,
            ipv6: false,
        }
    }
}

/// An ephemeral hidden service to publish
#[derive(Debug, Clone, Deserialize)]
pub struct HiddenServiceConfig {
    /// Port the local service listens on (bound to 127.0.0.1)
    pub local_port: u16,
    /// Port clients of the onion service see
    pub remote_port: u16,
    /// Key returned by a previous publish, or none for a new service
    pub private_key: Option<String>,
}
