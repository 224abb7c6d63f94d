//! Observer notifications
//!
//! Observer callbacks never run on the thread that produced them. Each
//! notification is queued together with the observer that was registered
//! at the time, and a single worker task delivers them one by one, so the
//! observer sees events in the order they happened.

use super::model::TorState;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Receives changes to the wrapper's state.
///
/// All calls happen on the wrapper's notification worker, one at a time.
pub trait Observer: Send + Sync {
    /// Called whenever the derived [`TorState`] changes.
    fn on_state(&self, state: TorState);

    /// Called whenever the bootstrap percentage changes.
    fn on_bootstrap_percentage(&self, _percentage: u8) {}

    /// Called whenever a hidden service descriptor is uploaded.
    fn on_hs_descriptor_upload(&self, _onion: &str) {}

    /// Called whenever Tor reports that the system clock is skewed.
    fn on_clock_skew_detected(&self, _skew_secs: i64) {}
}

/// A single observer callback waiting to be delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    State(TorState),
    BootstrapPercentage(u8),
    HsDescriptorUploaded(String),
    ClockSkewDetected(i64),
}

impl Notification {
    /// Invoke the matching observer callback
    pub fn deliver(&self, observer: &dyn Observer) {
        match self {
            Notification::State(state) => observer.on_state(*state),
            Notification::BootstrapPercentage(percentage) => {
                observer.on_bootstrap_percentage(*percentage)
            },
            Notification::HsDescriptorUploaded(onion) => observer.on_hs_descriptor_upload(onion),
            Notification::ClockSkewDetected(skew) => observer.on_clock_skew_detected(*skew),
        }
    }
}

type Queued = (Arc<dyn Observer>, Notification);

/// Receiving end of a [`NotificationQueue`]
pub type NotificationReceiver = mpsc::UnboundedReceiver<Queued>;

/// Producer handle for the sequential notification worker.
///
/// Pushing never blocks, so it is safe while holding the state lock.
#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::UnboundedSender<Queued>,
}

impl NotificationQueue {
    /// Create a queue without a worker; the caller drains the receiver
    pub fn new() -> (Self, NotificationReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Create a queue and spawn its delivery worker on the current runtime
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (queue, rx) = Self::new();
        let worker = tokio::spawn(run_worker(rx));
        (queue, worker)
    }

    pub fn push(&self, observer: Arc<dyn Observer>, notification: Notification) {
        if self.tx.send((observer, notification)).is_err() {
            debug!("Notification worker gone, dropping notification");
        }
    }
}

/// Deliver queued notifications in order until every producer is dropped
pub async fn run_worker(mut rx: NotificationReceiver) {
    while let Some((observer, notification)) = rx.recv().await {
        notification.deliver(observer.as_ref());
    }
    debug!("Notification worker stopped");
}
