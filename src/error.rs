//! Error types for the Tor wrapper.
//!
//! Every failure a caller can recover from is a variant here. Lifecycle
//! methods called in an illegal order are programming errors and panic
//! instead (see [`crate::state::NetworkState`]).

use thiserror::Error;

/// Core error type for wrapper operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The working directory or a generated file could not be created,
    /// written or read.
    #[error("configuration I/O failed: {0}")]
    ConfigurationIo(String),

    /// The daemon process could not be spawned.
    #[error("failed to launch Tor: {0}")]
    ProcessLaunch(String),

    /// A bounded startup wait ran out of time.
    #[error("timed out waiting for Tor: {0}")]
    ReadinessTimeout(String),

    /// The daemon's output ended before it reported its control listener.
    #[error("Tor exited before opening its control listener")]
    StartupFailed,

    /// A configuration call was made while no control channel is open.
    #[error("control connection not opened")]
    ChannelNotOpen,

    /// A reply from the control port was missing a required field.
    #[error("unexpected control port response: {0}")]
    ProtocolResponse(String),

    /// The control port rejected a command or the socket failed.
    #[error("control port error: {0}")]
    Control(String),

    /// The caller passed an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type alias using the wrapper's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors raised before any request reached the daemon.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Error::ChannelNotOpen | Error::InvalidArgument(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::ConfigurationIo(e.to_string())
    }
}
