//! Tor wrapper
//!
//! Owns one daemon process and its control connection, and exposes the
//! lifecycle and configuration operations a host application needs.
//!
//! start() and stop() must not be called concurrently on the same wrapper.
//! Configuration calls need an open control connection, i.e. a successful
//! start() and no stop() since.

use crate::config::WrapperConfig;
use crate::error::{Error, Result};
use crate::logging::ScrubbedOnion;
use crate::state::{NetworkFlags, NetworkState, NotificationQueue, Observer, TorState};
use crate::tor::control::{ControlChannel, ControlConnector, TcpConnector};
use crate::tor::dispatch::{parse_bootstrap_percentage, EventDispatcher};
use crate::tor::events::SUBSCRIBED_EVENTS;
use crate::tor::process::{self, LaunchOptions, TorProcess, COOKIE_POLL_INTERVAL, COOKIE_TIMEOUT, OWNER_ARG};
use crate::tor::torrc;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Key argument asking the daemon to generate a new v3 onion key
const NEW_ONION_KEY: &str = "NEW:ED25519-V3";
const HS_ADDRESS: &str = "ServiceID";
const HS_PRIVKEY: &str = "PrivateKey";

/// Events buffered between the control connection and the dispatcher
const EVENT_QUEUE_DEPTH: usize = 256;

/// A published hidden service
#[derive(Clone, PartialEq, Eq)]
pub struct HiddenServiceDescriptor {
    onion_address: String,
    private_key: String,
}

impl HiddenServiceDescriptor {
    /// The service ID, without the `.onion` suffix
    pub fn onion_address(&self) -> &str {
        &self.onion_address
    }

    /// Key that republishes the same service, `ED25519-V3:<base64>`
    pub fn private_key(&self) -> &str {
        &self.private_key
    }
}

impl fmt::Debug for HiddenServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HiddenServiceDescriptor")
            .field("onion_address", &ScrubbedOnion(&self.onion_address))
            .field("private_key", &"[redacted]")
            .finish()
    }
}

/// Supervises a Tor daemon
pub struct TorWrapper {
    config: WrapperConfig,
    connector: Arc<dyn ControlConnector>,
    state: Arc<NetworkState>,
    process: Mutex<Option<TorProcess>>,
    channel: Mutex<Option<Arc<dyn ControlChannel>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    /// Held from the unchanged check until the flags are updated, so two
    /// identical calls never both reach the daemon
    configuring: AsyncMutex<()>,
}

/// Lock a slot, ignoring poisoning; the slots hold no invariants
fn slot<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TorWrapper {
    /// Create a wrapper that talks to the daemon over TCP.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: WrapperConfig) -> Self {
        Self::with_connector(config, Arc::new(TcpConnector))
    }

    /// Create a wrapper with a custom way of opening the control connection
    pub fn with_connector(config: WrapperConfig, connector: Arc<dyn ControlConnector>) -> Self {
        // The worker exits once the state, and with it the queue, is dropped
        let (notifications, _worker) = NotificationQueue::spawn();
        Self {
            config,
            connector,
            state: Arc::new(NetworkState::new(notifications)),
            process: Mutex::new(None),
            channel: Mutex::new(None),
            dispatcher: Mutex::new(None),
            configuring: AsyncMutex::new(()),
        }
    }

    pub fn config(&self) -> &WrapperConfig {
        &self.config
    }

    /// Path of the obfs4 pluggable transport
    pub fn obfs4_executable(&self) -> PathBuf {
        self.config.obfs4_executable()
    }

    /// Replace or remove the observer. Notifications already queued still
    /// go to the observer that was current when they were produced.
    pub fn set_observer(&self, observer: Option<Arc<dyn Observer>>) {
        self.state.set_observer(observer);
    }

    pub fn state(&self) -> TorState {
        self.state.state()
    }

    /// True between a successful start() and the next stop()
    pub fn is_running(&self) -> bool {
        self.state.is_tor_running()
    }

    /// Snapshot of the network flags
    pub fn network_flags(&self) -> NetworkFlags {
        self.state.flags()
    }

    /// Launch the daemon and connect to it.
    ///
    /// Panics if called while the daemon is starting, running or stopping.
    /// On error, stop() must still be called to clean up.
    pub async fn start(&self) -> Result<()> {
        self.state.set_starting();

        let directory = &self.config.directory;
        tokio::fs::create_dir_all(directory).await.map_err(|e| {
            Error::ConfigurationIo(format!("creating {}: {}", directory.display(), e))
        })?;
        let config_file = self.config.config_file();
        torrc::write(&self.config, &config_file).await?;
        let cookie_file = self.config.cookie_file();
        process::delete_stale_cookie(&cookie_file).await;

        info!("Starting Tor");
        let executable = self.config.tor_executable();
        let mut tor = TorProcess::spawn(&LaunchOptions {
            executable: &executable,
            config_file: &config_file,
            owner_pid: std::process::id(),
            working_dir: directory,
        })?;
        let ready = tor.wait_until_ready().await;
        // Keep the handle even on failure so stop() can reap the process
        *slot(&self.process) = Some(tor);
        ready?;

        process::wait_for_cookie(&cookie_file, COOKIE_TIMEOUT, COOKIE_POLL_INTERVAL).await?;
        let cookie = tokio::fs::read(&cookie_file).await.map_err(|e| {
            Error::ConfigurationIo(format!("reading {}: {}", cookie_file.display(), e))
        })?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let channel = self.connector.connect(self.config.control_port, events_tx).await?;
        *slot(&self.channel) = Some(Arc::clone(&channel));

        channel.authenticate(&cookie).await?;
        channel.take_ownership().await?;
        // Ownership now follows the control connection rather than our pid
        channel.reset_conf(&[OWNER_ARG]).await?;

        let dispatcher = EventDispatcher::new(Arc::clone(&self.state));
        *slot(&self.dispatcher) = Some(tokio::spawn(dispatcher.run(events_rx)));
        channel.set_events(SUBSCRIBED_EVENTS).await?;

        if let Some(phase) = channel.get_info("status/bootstrap-phase").await? {
            if phase.contains("PROGRESS=") {
                if let Some(percentage) = parse_bootstrap_percentage(&phase) {
                    if percentage == 100 {
                        info!("Tor has already bootstrapped");
                    }
                    self.state.set_bootstrap_percentage(percentage);
                }
            }
        }
        if channel.get_info("status/circuit-established").await?.as_deref() == Some("1") {
            info!("Tor has already built a circuit");
            self.state.set_circuit_built(true);
        }

        self.state.set_started();
        Ok(())
    }

    /// Shut the daemon down and wait for it to exit.
    ///
    /// Every cleanup step runs even if an earlier one fails; the first
    /// failure is returned. Panics unless the daemon is starting or running.
    pub async fn stop(&self) -> Result<()> {
        self.state.set_stopping();
        let mut result = Ok(());
        let mut asked_to_exit = false;

        let channel = slot(&self.channel).take();
        if let Some(channel) = channel {
            info!("Stopping Tor");
            match channel.shutdown_tor("TERM").await {
                Ok(()) => asked_to_exit = true,
                Err(e) => {
                    warn!("Failed to send shutdown signal: {}", e);
                    result = Err(e);
                },
            }
            if let Err(e) = channel.close().await {
                warn!("Failed to close control connection: {}", e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        let tor = slot(&self.process).take();
        if let Some(mut tor) = tor {
            if !asked_to_exit {
                tor.kill();
            }
            tor.wait().await;
        }

        let dispatcher = slot(&self.dispatcher).take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
            let _ = dispatcher.await;
        }

        // A configuration call still in flight must not update the flags
        // after they are reset
        let _configuring = self.configuring.lock().await;
        self.state.set_stopped();
        result
    }

    fn channel(&self) -> Result<Arc<dyn ControlChannel>> {
        slot(&self.channel).clone().ok_or(Error::ChannelNotOpen)
    }

    /// Publish an onion service forwarding `remote_port` to
    /// `127.0.0.1:local_port`.
    ///
    /// Without a key, the daemon generates one and it is returned in the
    /// descriptor so the same address can be published again later.
    pub async fn publish_hidden_service(
        &self,
        local_port: u16,
        remote_port: u16,
        private_key: Option<&str>,
    ) -> Result<HiddenServiceDescriptor> {
        let channel = self.channel()?;
        let ports = [(remote_port, format!("127.0.0.1:{}", local_port))];
        let key = private_key.unwrap_or(NEW_ONION_KEY);

        let mut response = channel.add_onion(key, &ports).await?;
        let onion_address = response
            .remove(HS_ADDRESS)
            .ok_or_else(|| Error::ProtocolResponse("missing hidden service address".to_string()))?;
        let private_key = match private_key {
            Some(key) => key.to_string(),
            None => response
                .remove(HS_PRIVKEY)
                .ok_or_else(|| Error::ProtocolResponse("missing private key".to_string()))?,
        };

        info!("Published hidden service {}", ScrubbedOnion(&onion_address));
        Ok(HiddenServiceDescriptor {
            onion_address,
            private_key,
        })
    }

    pub async fn remove_hidden_service(&self, onion_address: &str) -> Result<()> {
        let channel = self.channel()?;
        channel.del_onion(onion_address).await?;
        info!("Removed hidden service {}", ScrubbedOnion(onion_address));
        Ok(())
    }

    /// Enable or disable the network. The first call always reaches the
    /// daemon, which starts with its network disabled.
    pub async fn enable_network(&self, enable: bool) -> Result<()> {
        let channel = self.channel()?;
        let _configuring = self.configuring.lock().await;
        let flags = self.state.flags();
        if flags.network_initialised && flags.network_enabled == enable {
            return Ok(());
        }
        channel
            .set_conf("DisableNetwork", if enable { "0" } else { "1" })
            .await?;
        self.state.enable_network(enable);
        Ok(())
    }

    /// Use the given bridges, each a torrc line including the `Bridge`
    /// keyword. An empty list is an error; use disable_bridges() instead.
    pub async fn enable_bridges(&self, bridges: &[String]) -> Result<()> {
        if bridges.is_empty() {
            return Err(Error::InvalidArgument(
                "empty bridge list, use disable_bridges()".to_string(),
            ));
        }
        let channel = self.channel()?;
        let _configuring = self.configuring.lock().await;
        if self.state.flags().bridges == bridges {
            return Ok(());
        }
        let mut conf = Vec::with_capacity(bridges.len() + 1);
        conf.push("UseBridges 1".to_string());
        conf.extend(bridges.iter().cloned());
        channel.set_conf_lines(&conf).await?;
        self.state.set_bridges(bridges);
        Ok(())
    }

    pub async fn disable_bridges(&self) -> Result<()> {
        let channel = self.channel()?;
        let _configuring = self.configuring.lock().await;
        if self.state.flags().bridges.is_empty() {
            return Ok(());
        }
        channel.set_conf("UseBridges", "0").await?;
        self.state.set_bridges(&[]);
        Ok(())
    }

    pub async fn enable_connection_padding(&self, enable: bool) -> Result<()> {
        let channel = self.channel()?;
        let _configuring = self.configuring.lock().await;
        if self.state.flags().padding_enabled == enable {
            return Ok(());
        }
        channel
            .set_conf("ConnectionPadding", if enable { "1" } else { "0" })
            .await?;
        self.state.enable_connection_padding(enable);
        Ok(())
    }

    /// Prefer IPv6 over IPv4, or the other way round. Exactly one address
    /// family is used.
    pub async fn enable_ipv6(&self, enable: bool) -> Result<()> {
        let channel = self.channel()?;
        let _configuring = self.configuring.lock().await;
        if self.state.flags().ipv6_enabled == enable {
            return Ok(());
        }
        let conf = [
            format!("ClientUseIPv4 {}", if enable { 0 } else { 1 }),
            format!("ClientUseIPv6 {}", if enable { 1 } else { 0 }),
        ];
        channel.set_conf_lines(&conf).await?;
        self.state.enable_ipv6(enable);
        Ok(())
    }
}
