//! Tor daemon interaction
//!
//! Launching and supervising the daemon, its generated torrc, and the
//! control port connection whose events drive the connectivity state.

pub mod control;
pub mod dispatch;
pub mod events;
pub mod process;
pub mod torrc;

pub use control::{ControlChannel, ControlConnector, ControlPort, TcpConnector};
pub use dispatch::EventDispatcher;
pub use events::TorEvent;
pub use process::TorProcess;
