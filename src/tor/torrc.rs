//! Generated torrc
//!
//! The daemon is always started from the same defaults; anything else is
//! applied over the control port after start.

use crate::config::WrapperConfig;
use crate::error::{Error, Result};
use std::fmt::Write;
use std::path::Path;

/// Render the torrc for the given wrapper configuration
pub fn generate(config: &WrapperConfig) -> String {
    let obfs4 = config.obfs4_executable();
    let snowflake = config.snowflake_executable();

    let mut torrc = String::new();
    append(&mut torrc, "ControlPort", config.control_port);
    append(&mut torrc, "CookieAuthentication", 1);
    append(&mut torrc, "DataDirectory", config.data_directory().display());
    append(&mut torrc, "DisableNetwork", 1);
    append(&mut torrc, "SafeSocks", 1);
    append(&mut torrc, "SocksPort", config.socks_port);
    torrc.push_str("GeoIPFile\n");
    torrc.push_str("GeoIPv6File\n");
    append(&mut torrc, "ConnectionPadding", 0);
    append(&mut torrc, "ClientTransportPlugin obfs4 exec", obfs4.display());
    append(&mut torrc, "ClientTransportPlugin meek_lite exec", obfs4.display());
    append(&mut torrc, "ClientTransportPlugin snowflake exec", snowflake.display());
    torrc
}

fn append(torrc: &mut String, name: &str, value: impl std::fmt::Display) {
    let _ = writeln!(torrc, "{} {}", name, value);
}

/// Write the torrc, replacing whatever a previous start left behind
pub async fn write(config: &WrapperConfig, path: &Path) -> Result<()> {
    tokio::fs::write(path, generate(config))
        .await
        .map_err(|e| Error::ConfigurationIo(format!("writing {}: {}", path.display(), e)))
}
