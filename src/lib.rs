//! onionwrapper library crate
//!
//! Supervises a Tor daemon: launches it, authenticates to its control
//! port, follows its events and derives a single connectivity state.
//!
//! # Modules
//!
//! - [`cli`] - Command-line interface (run, torrc)
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Error type for wrapper operations
//! - [`logging`] - Subscriber setup and onion address scrubbing
//! - [`state`] - Connectivity state and observer notifications
//! - [`tor`] - Daemon process, torrc, control port and events
//! - [`wrapper`] - The [`TorWrapper`] lifecycle and configuration surface

#![allow(clippy::doc_markdown)] // Doc formatting is secondary
#![allow(clippy::uninlined_format_args)] // Format string style preference
#![allow(clippy::missing_const_for_fn)] // Const fn optimization is low priority
#![allow(clippy::option_if_let_else)] // Style preference
#![allow(clippy::use_self)] // Explicit types are clearer
#![allow(clippy::significant_drop_tightening)] // Lock scope is intentional
#![allow(clippy::single_match_else)] // Match for clarity
#![allow(clippy::new_without_default)] // Explicit new() is fine
#![allow(clippy::redundant_closure_for_method_calls)] // Explicit closures
#![allow(clippy::map_unwrap_or)] // map().unwrap_or is clearer
#![allow(clippy::format_push_string)] // Clarity over allocation

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod state;
pub mod tor;
pub mod wrapper;

pub use error::{Error, Result};
pub use state::{Observer, TorState};
pub use wrapper::{HiddenServiceDescriptor, TorWrapper};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
