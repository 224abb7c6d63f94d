//! Asynchronous control port events
//!
//! Tor sends events as `650` replies once they have been requested with
//! SETEVENTS. The kinds the wrapper acts on get typed variants; everything
//! else is passed through as a (kind, message) pair.

/// Event kinds the wrapper subscribes to
pub const SUBSCRIBED_EVENTS: &[&str] = &[
    "CIRC",
    "ORCONN",
    "STATUS_GENERAL",
    "STATUS_CLIENT",
    "HS_DESC",
    "NOTICE",
    "WARN",
    "ERR",
];

/// Severities Tor uses for log message events
const MESSAGE_SEVERITIES: &[&str] = &["DEBUG", "INFO", "NOTICE", "WARN", "ERR"];

/// An event received from the control port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorEvent {
    /// `CIRC <id> <status> [<path>]`
    CircuitStatus {
        status: String,
        id: String,
        path: String,
    },
    /// `ORCONN <target> <status>`
    OrConnStatus { status: String, or_name: String },
    /// `BW <read> <written>`
    BandwidthUsed { read: u64, written: u64 },
    /// `NEWDESC <server>...`
    NewDescriptors(Vec<String>),
    /// A log message forwarded by Tor
    Message { severity: String, msg: String },
    /// Any other event, including STATUS_CLIENT, STATUS_GENERAL and HS_DESC
    Unrecognized { kind: String, msg: String },
    /// The control connection has closed; no further events follow
    ConnectionClosed,
}

impl TorEvent {
    /// Parse the text of an asynchronous reply, without the `650 ` prefix
    pub fn parse(body: &str) -> Self {
        let (kind, rest) = match body.split_once(' ') {
            Some((kind, rest)) => (kind, rest),
            None => (body, ""),
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();

        match kind {
            "CIRC" if fields.len() >= 2 => TorEvent::CircuitStatus {
                id: fields[0].to_string(),
                status: fields[1].to_string(),
                // Keyword arguments follow the path, and LAUNCHED has no path
                path: fields
                    .get(2)
                    .filter(|f| !f.contains('='))
                    .map(|f| f.to_string())
                    .unwrap_or_default(),
            },
            "ORCONN" if fields.len() >= 2 => TorEvent::OrConnStatus {
                or_name: fields[0].to_string(),
                status: fields[1].to_string(),
            },
            "BW" if fields.len() >= 2 => match (fields[0].parse(), fields[1].parse()) {
                (Ok(read), Ok(written)) => TorEvent::BandwidthUsed { read, written },
                _ => unrecognized(kind, rest),
            },
            "NEWDESC" => TorEvent::NewDescriptors(fields.iter().map(|f| f.to_string()).collect()),
            severity if MESSAGE_SEVERITIES.contains(&severity) => TorEvent::Message {
                severity: severity.to_string(),
                msg: rest.to_string(),
            },
            _ => unrecognized(kind, rest),
        }
    }
}

fn unrecognized(kind: &str, msg: &str) -> TorEvent {
    TorEvent::Unrecognized {
        kind: kind.to_string(),
        msg: msg.to_string(),
    }
}
