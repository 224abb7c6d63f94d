//! Connectivity state model
//!
//! Every flag that feeds the externally visible [`TorState`] lives in one
//! aggregate behind one lock. The visible state is never stored on its
//! own: it is recomputed from the aggregate after every mutation, and the
//! observer hears about it only when the recomputed value differs from the
//! last one it was told.

use super::notify::{Notification, NotificationQueue, Observer};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

/// Lifecycle of the daemon process, as driven by start() and stop()
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessState {
    #[default]
    NotStarted,
    Starting,
    Started,
    Stopping,
    Stopped,
}

/// Externally observable state of the wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TorState {
    /// Created, start() not yet called. The initial state.
    NotStarted,
    /// start() has been called and the daemon is starting.
    Starting,
    /// The daemon has started; the network has not been enabled or
    /// disabled yet, so no connections are made.
    Started,
    /// Network enabled; connecting (or reconnecting) to the Tor network.
    Connecting,
    /// Network enabled and connected; the SOCKS port is usable.
    Connected,
    /// The daemon is running with its network disabled.
    Disabled,
    /// stop() has been called and the daemon is stopping.
    Stopping,
    /// The daemon has stopped. start() may be called again.
    Stopped,
}

impl TorState {
    /// Project the process state and network flags onto the visible state
    pub fn derive(process: ProcessState, flags: &NetworkFlags) -> Self {
        match process {
            ProcessState::NotStarted => TorState::NotStarted,
            ProcessState::Starting => TorState::Starting,
            ProcessState::Stopping => TorState::Stopping,
            ProcessState::Stopped => TorState::Stopped,
            ProcessState::Started => {
                if !flags.network_initialised {
                    TorState::Started
                } else if !flags.network_enabled {
                    TorState::Disabled
                } else if flags.bootstrap_percentage == 100
                    && flags.circuit_built
                    && flags.or_connections_connected > 0
                {
                    TorState::Connected
                } else {
                    TorState::Connecting
                }
            },
        }
    }
}

/// Everything about a running daemon that is reset when it stops
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkFlags {
    /// enableNetwork() has been called at least once
    pub network_initialised: bool,
    pub network_enabled: bool,
    /// Not part of the visible state
    pub padding_enabled: bool,
    /// Not part of the visible state
    pub ipv6_enabled: bool,
    pub circuit_built: bool,
    pub bootstrap_percentage: u8,
    /// Bridge lines in use; empty when bridges are disabled
    pub bridges: Vec<String>,
    /// Live connections to first-hop relays
    pub or_connections_connected: u32,
}

struct Inner {
    observer: Option<Arc<dyn Observer>>,
    process: ProcessState,
    flags: NetworkFlags,
    last_notified: Option<TorState>,
}

/// The single owner of the connectivity aggregate
pub struct NetworkState {
    inner: Mutex<Inner>,
    notifications: NotificationQueue,
}

impl NetworkState {
    pub fn new(notifications: NotificationQueue) -> Self {
        Self {
            inner: Mutex::new(Inner {
                observer: None,
                process: ProcessState::NotStarted,
                flags: NetworkFlags::default(),
                last_notified: None,
            }),
            notifications,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic from an illegal transition must not wedge the wrapper
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_observer(&self, observer: Option<Arc<dyn Observer>>) {
        self.lock().observer = observer;
    }

    /// Current visible state
    pub fn state(&self) -> TorState {
        let inner = self.lock();
        TorState::derive(inner.process, &inner.flags)
    }

    pub fn process_state(&self) -> ProcessState {
        self.lock().process
    }

    /// Copy of the current flags
    pub fn flags(&self) -> NetworkFlags {
        self.lock().flags.clone()
    }

    pub fn is_tor_running(&self) -> bool {
        self.lock().process == ProcessState::Started
    }

    /// Legal from NotStarted or Stopped; panics otherwise
    pub fn set_starting(&self) {
        let mut inner = self.lock();
        if !matches!(inner.process, ProcessState::NotStarted | ProcessState::Stopped) {
            panic!("start() called in process state {:?}", inner.process);
        }
        inner.process = ProcessState::Starting;
        self.update_state(&mut inner);
    }

    /// Legal only from Starting; panics otherwise
    pub fn set_started(&self) {
        let mut inner = self.lock();
        if inner.process != ProcessState::Starting {
            panic!(
                "start() and stop() called concurrently (process state {:?})",
                inner.process
            );
        }
        inner.process = ProcessState::Started;
        self.update_state(&mut inner);
    }

    /// Legal from Starting (start() failed or is in progress) or Started
    pub fn set_stopping(&self) {
        let mut inner = self.lock();
        if !matches!(inner.process, ProcessState::Starting | ProcessState::Started) {
            panic!("stop() called in process state {:?}", inner.process);
        }
        inner.process = ProcessState::Stopping;
        self.update_state(&mut inner);
    }

    /// Legal only from Stopping. Resets every flag of the stopped process.
    pub fn set_stopped(&self) {
        let mut inner = self.lock();
        if inner.process != ProcessState::Stopping {
            panic!(
                "start() and stop() called concurrently (process state {:?})",
                inner.process
            );
        }
        inner.process = ProcessState::Stopped;
        inner.flags = NetworkFlags::default();
        self.update_state(&mut inner);
    }

    pub fn set_bootstrap_percentage(&self, percentage: u8) {
        let mut inner = self.lock();
        if inner.flags.bootstrap_percentage == percentage {
            return;
        }
        inner.flags.bootstrap_percentage = percentage;
        self.notify(&inner, Notification::BootstrapPercentage(percentage));
        self.update_state(&mut inner);
    }

    /// Returns true if the flag changed
    pub fn set_circuit_built(&self, built: bool) -> bool {
        let mut inner = self.lock();
        if inner.flags.circuit_built == built {
            return false;
        }
        inner.flags.circuit_built = built;
        self.update_state(&mut inner);
        true
    }

    /// Returns true if the daemon needs to be told: the first call, or a
    /// change of value. Disabling the network also clears circuit_built.
    pub fn enable_network(&self, enable: bool) -> bool {
        let mut inner = self.lock();
        let was_initialised = inner.flags.network_initialised;
        let was_enabled = inner.flags.network_enabled;
        inner.flags.network_initialised = true;
        inner.flags.network_enabled = enable;
        if !enable {
            inner.flags.circuit_built = false;
        }
        self.update_state(&mut inner);
        !was_initialised || enable != was_enabled
    }

    /// Returns true if the flag changed
    pub fn enable_connection_padding(&self, enable: bool) -> bool {
        let mut inner = self.lock();
        if inner.flags.padding_enabled == enable {
            return false;
        }
        inner.flags.padding_enabled = enable;
        true
    }

    /// Returns true if the flag changed
    pub fn enable_ipv6(&self, enable: bool) -> bool {
        let mut inner = self.lock();
        if inner.flags.ipv6_enabled == enable {
            return false;
        }
        inner.flags.ipv6_enabled = enable;
        true
    }

    /// Returns true if the list changed (order-sensitive)
    pub fn set_bridges(&self, bridges: &[String]) -> bool {
        let mut inner = self.lock();
        if inner.flags.bridges == bridges {
            return false;
        }
        inner.flags.bridges = bridges.to_vec();
        true
    }

    pub fn on_or_connection_connected(&self) {
        let mut inner = self.lock();
        inner.flags.or_connections_connected += 1;
        info!(
            "{} OR connections connected",
            inner.flags.or_connections_connected
        );
        self.update_state(&mut inner);
    }

    pub fn on_or_connection_closed(&self) {
        let mut inner = self.lock();
        if inner.flags.or_connections_connected == 0 {
            warn!("Count was zero before connection closed");
        } else {
            inner.flags.or_connections_connected -= 1;
        }
        info!(
            "{} OR connections connected",
            inner.flags.or_connections_connected
        );
        self.update_state(&mut inner);
    }

    pub fn on_hs_descriptor_uploaded(&self, onion: &str) {
        let inner = self.lock();
        self.notify(&inner, Notification::HsDescriptorUploaded(onion.to_string()));
    }

    pub fn on_clock_skew_detected(&self, skew_secs: i64) {
        let inner = self.lock();
        self.notify(&inner, Notification::ClockSkewDetected(skew_secs));
    }

    /// The only place state-change notifications are produced
    fn update_state(&self, inner: &mut Inner) {
        let state = TorState::derive(inner.process, &inner.flags);
        if inner.last_notified != Some(state) {
            inner.last_notified = Some(state);
            self.notify(inner, Notification::State(state));
        }
    }

    fn notify(&self, inner: &Inner, notification: Notification) {
        if let Some(observer) = &inner.observer {
            self.notifications.push(Arc::clone(observer), notification);
        }
    }
}
