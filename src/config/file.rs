//! Configuration file loading

use super::Config;
use anyhow::{Context, Result};
use std::path::Path;

/// Load and parse config from path
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse(&contents).with_context(|| format!("Invalid config file: {}", path.display()))
}

/// Parse and validate config from TOML text
pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("Failed to parse TOML")?;

    super::validate(&config)?;

    Ok(config)
}
