//! Event dispatch
//!
//! Turns control port events into updates of the connectivity state.
//! Events are handled one at a time, in arrival order, by a single task.

use super::events::TorEvent;
use crate::logging::ScrubbedOnion;
use crate::state::NetworkState;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

static BOOTSTRAP_PERCENTAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^.*PROGRESS=(\d{1,3}).*$").expect("bootstrap pattern is valid")
});

/// Extract the percentage from a bootstrap status line.
///
/// Values that do not parse, or exceed 100, are logged and ignored.
pub fn parse_bootstrap_percentage(msg: &str) -> Option<u8> {
    let parsed = BOOTSTRAP_PERCENTAGE
        .captures(msg)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u8>().ok())
        .filter(|p| *p <= 100);
    if parsed.is_none() {
        warn!("Could not parse bootstrap percentage: {}", msg);
    }
    parsed
}

/// Parse `NAME=<integer>` out of a status message
fn parse_long_argument(msg: &str, name: &str) -> Option<i64> {
    msg.split_whitespace()
        .filter_map(|arg| arg.split_once('='))
        .find(|(key, _)| *key == name)
        .and_then(|(_, value)| value.parse().ok())
}

/// Drop the leading severity from a status event message
fn remove_severity(msg: &str) -> &str {
    msg.split_once(' ').map_or(msg, |(_, rest)| rest)
}

/// Applies control port events to the connectivity state
#[derive(Clone)]
pub struct EventDispatcher {
    state: Arc<NetworkState>,
}

impl EventDispatcher {
    pub fn new(state: Arc<NetworkState>) -> Self {
        Self { state }
    }

    /// Handle events until the sending side goes away
    pub async fn run(self, mut events: mpsc::Receiver<TorEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        debug!("Event stream ended");
    }

    pub fn handle(&self, event: TorEvent) {
        match event {
            TorEvent::CircuitStatus { status, .. } => {
                if status == "BUILT" && self.state.set_circuit_built(true) {
                    info!("Circuit built");
                }
            },
            TorEvent::OrConnStatus { status, .. } => {
                debug!("OR connection {}", status);
                match status.as_str() {
                    "CONNECTED" => self.state.on_or_connection_connected(),
                    "CLOSED" => self.state.on_or_connection_closed(),
                    _ => {},
                }
            },
            TorEvent::BandwidthUsed { read, written } => {
                trace!(read, written, "Bandwidth used");
            },
            TorEvent::NewDescriptors(_) => {},
            TorEvent::Message { severity, msg } => match severity.as_str() {
                "ERR" => error!("{} {}", severity, msg),
                "WARN" => warn!("{} {}", severity, msg),
                "NOTICE" => info!("{} {}", severity, msg),
                _ => debug!("{} {}", severity, msg),
            },
            TorEvent::Unrecognized { kind, msg } => match kind.as_str() {
                "STATUS_CLIENT" => self.handle_client_status(remove_severity(&msg)),
                "STATUS_GENERAL" => self.handle_general_status(remove_severity(&msg)),
                "HS_DESC" => self.handle_hs_descriptor(&msg),
                _ => trace!("Unhandled event {} {}", kind, msg),
            },
            TorEvent::ConnectionClosed => {
                if self.state.is_tor_running() {
                    warn!("Control connection closed");
                }
            },
        }
    }

    fn handle_client_status(&self, msg: &str) {
        if msg.starts_with("BOOTSTRAP PROGRESS=") {
            if let Some(percentage) = parse_bootstrap_percentage(msg) {
                if percentage == 100 {
                    info!("Bootstrapped");
                }
                self.state.set_bootstrap_percentage(percentage);
            }
        } else if msg.starts_with("CIRCUIT_ESTABLISHED") {
            if self.state.set_circuit_built(true) {
                info!("Circuit built");
            }
        } else if msg.starts_with("CIRCUIT_NOT_ESTABLISHED") {
            info!("Circuit not established");
            self.state.set_circuit_built(false);
        }
    }

    fn handle_general_status(&self, msg: &str) {
        if msg.starts_with("CLOCK_JUMPED") {
            if let Some(time) = parse_long_argument(msg, "TIME") {
                warn!("Clock jumped {} seconds", time);
            }
        } else if msg.starts_with("CLOCK_SKEW") {
            if let Some(skew) = parse_long_argument(msg, "SKEW") {
                warn!("Clock is skewed by {} seconds", skew);
                self.state.on_clock_skew_detected(skew);
            }
        }
    }

    fn handle_hs_descriptor(&self, msg: &str) {
        if !msg.starts_with("UPLOADED") {
            return;
        }
        let parts: Vec<&str> = msg.split_whitespace().collect();
        if parts.len() < 2 {
            warn!("Failed to parse HS_DESC UPLOADED event: {}", msg);
            return;
        }
        info!("V3 descriptor uploaded for {}", ScrubbedOnion(parts[1]));
        self.state.on_hs_descriptor_uploaded(parts[1]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Notification, NotificationQueue, Observer, TorState};
    use crate::state::notify::NotificationReceiver;

    struct Nop;

    impl Observer for Nop {
        fn on_state(&self, _state: TorState) {}
    }

    fn running() -> (EventDispatcher, Arc<NetworkState>, NotificationReceiver) {
        let (queue, mut rx) = NotificationQueue::new();
        let state = Arc::new(NetworkState::new(queue));
        state.set_observer(Some(Arc::new(Nop)));
        state.set_starting();
        state.set_started();
        state.enable_network(true);
        while rx.try_recv().is_ok() {}
        (EventDispatcher::new(state.clone()), state, rx)
    }

    fn drain(rx: &mut NotificationReceiver) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok((_, n)) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    fn event(body: &str) -> TorEvent {
        TorEvent::parse(body)
    }

    #[test]
    fn test_parse_bootstrap_percentage() {
        assert_eq!(
            parse_bootstrap_percentage("NOTICE BOOTSTRAP PROGRESS=85 TAG=ap_conn_done SUMMARY=\"Connecting\""),
            Some(85)
        );
        assert_eq!(parse_bootstrap_percentage("BOOTSTRAP PROGRESS=100"), Some(100));
        assert_eq!(parse_bootstrap_percentage("BOOTSTRAP PROGRESS=abc"), None);
        assert_eq!(parse_bootstrap_percentage("BOOTSTRAP PROGRESS=250"), None);
    }

    #[test]
    fn test_parse_long_argument() {
        assert_eq!(parse_long_argument("CLOCK_SKEW SKEW=-3600 SOURCE=DIRSERV", "SKEW"), Some(-3600));
        assert_eq!(parse_long_argument("CLOCK_JUMPED TIME=120", "TIME"), Some(120));
        assert_eq!(parse_long_argument("CLOCK_SKEW SOURCE=DIRSERV", "SKEW"), None);
    }

    #[test]
    fn test_bootstrap_to_connected() {
        let (dispatcher, state, mut rx) = running();
        dispatcher.handle(event("STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY=\"Done\""));
        dispatcher.handle(event("CIRC 1 BUILT $AAAA~a,$BBBB~b,$CCCC~c PURPOSE=GENERAL"));
        dispatcher.handle(event("ORCONN $AAAA~a CONNECTED"));

        assert_eq!(state.state(), TorState::Connected);
        assert_eq!(
            drain(&mut rx),
            vec![
                Notification::BootstrapPercentage(100),
                Notification::State(TorState::Connected),
            ]
        );
    }

    #[test]
    fn test_unparseable_bootstrap_is_ignored() {
        let (dispatcher, state, mut rx) = running();
        dispatcher.handle(event("STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=999"));
        assert_eq!(state.flags().bootstrap_percentage, 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_circuit_established_status() {
        let (dispatcher, state, _rx) = running();
        dispatcher.handle(event("STATUS_CLIENT NOTICE CIRCUIT_ESTABLISHED"));
        assert!(state.flags().circuit_built);
        dispatcher.handle(event("STATUS_CLIENT NOTICE CIRCUIT_NOT_ESTABLISHED REASON=CLOCK_JUMPED"));
        assert!(!state.flags().circuit_built);
    }

    #[test]
    fn test_orconn_counts() {
        let (dispatcher, state, _rx) = running();
        dispatcher.handle(event("ORCONN $AAAA~a CONNECTED"));
        dispatcher.handle(event("ORCONN $BBBB~b CONNECTED"));
        dispatcher.handle(event("ORCONN $AAAA~a CLOSED REASON=DONE"));
        dispatcher.handle(event("ORCONN $CCCC~c LAUNCHED"));
        assert_eq!(state.flags().or_connections_connected, 1);
    }

    #[test]
    fn test_clock_events() {
        let (dispatcher, _state, mut rx) = running();
        dispatcher.handle(event("STATUS_GENERAL WARN CLOCK_JUMPED TIME=300"));
        assert!(drain(&mut rx).is_empty());
        dispatcher.handle(event("STATUS_GENERAL WARN CLOCK_SKEW SKEW=-7200 SOURCE=CONSENSUS"));
        assert_eq!(drain(&mut rx), vec![Notification::ClockSkewDetected(-7200)]);
    }

    #[test]
    fn test_hs_descriptor_uploaded() {
        let (dispatcher, _state, mut rx) = running();
        dispatcher.handle(event("HS_DESC UPLOADED abcdefghij234567 UNKNOWN $DDDD~hsdir"));
        dispatcher.handle(event("HS_DESC UPLOAD abcdefghij234567 UNKNOWN $DDDD~hsdir"));
        dispatcher.handle(event("HS_DESC UPLOADED"));
        assert_eq!(
            drain(&mut rx),
            vec![Notification::HsDescriptorUploaded("abcdefghij234567".to_string())]
        );
    }

    #[test]
    fn test_messages_do_not_touch_state() {
        let (dispatcher, state, mut rx) = running();
        dispatcher.handle(event("NOTICE Bootstrapped 100% (done): Done"));
        dispatcher.handle(event("WARN something odd"));
        dispatcher.handle(event("ERR something bad"));
        dispatcher.handle(TorEvent::ConnectionClosed);
        assert_eq!(state.state(), TorState::Connecting);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_run_until_sender_dropped() {
        let (dispatcher, state, _rx) = running();
        let (tx, events) = mpsc::channel(8);
        let task = tokio::spawn(dispatcher.run(events));
        tx.send(event("ORCONN $AAAA~a CONNECTED")).await.unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(state.flags().or_connections_connected, 1);
    }
}
