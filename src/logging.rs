//! Logging configuration
//!
//! Structured logging with tracing, plus a display wrapper that keeps
//! onion addresses out of log output.

use std::fmt;
use tracing::Level;
use tracing_subscriber::fmt as subscriber_fmt;
use tracing_subscriber::EnvFilter;

/// Number of leading characters of an onion address kept in logs
const ONION_PREFIX_LEN: usize = 10;

/// Initialize logging with environment-based filtering
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("onionwrapper=info"));

    subscriber_fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Initialize logging with specific level
pub fn init_with_level(level: Level) {
    let filter = EnvFilter::new(format!("onionwrapper={}", level));

    subscriber_fmt().with_env_filter(filter).with_target(true).init();
}

/// Displays an onion address truncated to its first few characters.
pub struct ScrubbedOnion<'a>(pub &'a str);

impl fmt::Display for ScrubbedOnion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(ONION_PREFIX_LEN).collect();
        write!(f, "{}[scrubbed]", prefix)
    }
}

impl fmt::Debug for ScrubbedOnion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
