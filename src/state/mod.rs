//! Connectivity state
//!
//! The lifecycle of the daemon process, the flags driven by configuration
//! calls and daemon events, and the observer that hears about changes.

pub mod model;
pub mod notify;

pub use model::{NetworkFlags, NetworkState, ProcessState, TorState};
pub use notify::{Notification, NotificationQueue, Observer};
