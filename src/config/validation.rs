//! Configuration validation
//!
//! Fail-fast validation of configuration invariants.

use super::Config;
use anyhow::{bail, Result};

/// Validate configuration invariants
pub fn validate(config: &Config) -> Result<()> {
    validate_tor(config)?;
    validate_network(config)?;
    validate_hidden_services(config)?;
    Ok(())
}

fn validate_tor(config: &Config) -> Result<()> {
    if config.tor.directory.as_os_str().is_empty() {
        bail!("tor.directory cannot be empty");
    }
    if config.tor.socks_port == 0 {
        bail!("tor.socks_port cannot be 0");
    }
    if config.tor.control_port == 0 {
        bail!("tor.control_port cannot be 0");
    }
    if config.tor.socks_port == config.tor.control_port {
        bail!(
            "tor.socks_port and tor.control_port must differ (both {})",
            config.tor.socks_port
        );
    }
    Ok(())
}

fn validate_network(config: &Config) -> Result<()> {
    for (i, bridge) in config.network.bridges.iter().enumerate() {
        if bridge.trim().is_empty() {
            bail!("network.bridges[{}] is blank", i);
        }
        if bridge.contains('\n') || bridge.contains('\r') {
            bail!("network.bridges[{}] must be a single line", i);
        }
    }
    Ok(())
}

fn validate_hidden_services(config: &Config) -> Result<()> {
    for (i, hs) in config.hidden_service.iter().enumerate() {
        if hs.local_port == 0 || hs.remote_port == 0 {
            bail!("hidden_service[{}] ports cannot be 0", i);
        }
        if let Some(key) = &hs.private_key {
            if key.trim().is_empty() {
                bail!("hidden_service[{}].private_key is blank", i);
            }
        }
    }
    Ok(())
}
