//! Run command - supervise Tor until interrupted
//!
//! 1. Start Tor from the `[tor]` table
//! 2. Apply padding, IPv6, bridges and network from `[network]`
//! 3. Publish each `[[hidden_service]]`
//! 4. Wait for Ctrl-C, then stop Tor

use super::RunArgs;
use crate::config::{self, Config};
use crate::logging::ScrubbedOnion;
use crate::state::{Observer, TorState};
use crate::wrapper::TorWrapper;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Logs everything the wrapper reports
struct LogObserver;

impl Observer for LogObserver {
    fn on_state(&self, state: TorState) {
        info!(?state, "Tor state changed");
    }

    fn on_bootstrap_percentage(&self, percentage: u8) {
        info!("Bootstrapped {}%", percentage);
    }

    fn on_hs_descriptor_upload(&self, onion: &str) {
        info!("Descriptor uploaded for {}", ScrubbedOnion(onion));
    }

    fn on_clock_skew_detected(&self, skew_secs: i64) {
        warn!("Clock skew of {} seconds detected", skew_secs);
    }
}

/// Run the run command
pub async fn run_wrapper(args: &RunArgs) -> Result<()> {
    let config = config::load_from_path(&args.config)?;
    info!("onionwrapper v{} starting", crate::VERSION);

    let wrapper = TorWrapper::new(config.tor.clone());
    wrapper.set_observer(Some(Arc::new(LogObserver)));

    if let Err(e) = wrapper.start().await {
        if let Err(stop_err) = wrapper.stop().await {
            warn!("Cleanup after failed start: {}", stop_err);
        }
        return Err(e).context("Failed to start Tor");
    }

    let outcome = configure(&wrapper, &config).await;
    if outcome.is_ok() {
        info!("Running, press Ctrl-C to stop");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
    }

    wrapper.stop().await.context("Failed to stop Tor")?;
    outcome
}

async fn configure(wrapper: &TorWrapper, config: &Config) -> Result<()> {
    let network = &config.network;
    wrapper.enable_connection_padding(network.connection_padding).await?;
    wrapper.enable_ipv6(network.ipv6).await?;
    if network.bridges.is_empty() {
        wrapper.disable_bridges().await?;
    } else {
        wrapper.enable_bridges(&network.bridges).await?;
    }
    wrapper.enable_network(network.enable).await?;

    for service in &config.hidden_service {
        let descriptor = wrapper
            .publish_hidden_service(
                service.local_port,
                service.remote_port,
                service.private_key.as_deref(),
            )
            .await
            .with_context(|| format!("Failed to publish hidden service on port {}", service.local_port))?;

        println!("{}.onion -> 127.0.0.1:{}", descriptor.onion_address(), service.local_port);
        if service.private_key.is_none() {
            println!("  private_key = \"{}\"", descriptor.private_key());
        }
    }
    Ok(())
}
