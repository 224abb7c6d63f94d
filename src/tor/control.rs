//! Tor Control Port client
//!
//! Commands and their replies share one TCP connection with asynchronous
//! `650` events. A reader task splits the two: replies go back to whichever
//! command is waiting, events are forwarded to the event channel.

use super::events::TorEvent;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Status code of asynchronous event replies
const EVENT_STATUS: u16 = 650;

/// Operations the wrapper performs over an authenticated control connection
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Authenticate with the contents of the control auth cookie
    async fn authenticate(&self, cookie: &[u8]) -> Result<()>;

    /// Make the daemon exit when this connection closes
    async fn take_ownership(&self) -> Result<()>;

    async fn reset_conf(&self, keys: &[&str]) -> Result<()>;

    /// Set a single configuration key
    async fn set_conf(&self, key: &str, value: &str) -> Result<()> {
        self.set_conf_lines(&[format!("{} {}", key, value)]).await
    }

    /// Set several configuration entries in one command.
    ///
    /// Each entry is a key, optionally followed by a space and its value.
    /// Repeating a key sets a list.
    async fn set_conf_lines(&self, lines: &[String]) -> Result<()>;

    /// Query a GETINFO key, returning None if the reply does not carry it
    async fn get_info(&self, key: &str) -> Result<Option<String>>;

    /// Create an onion service.
    ///
    /// `key` is either `NEW:<type>` or `<type>:<blob>`; each port maps a
    /// virtual port to a target. Returns the key/value lines of the reply.
    async fn add_onion(&self, key: &str, ports: &[(u16, String)]) -> Result<HashMap<String, String>>;

    async fn del_onion(&self, service_id: &str) -> Result<()>;

    async fn set_events(&self, events: &[&str]) -> Result<()>;

    /// Send SIGNAL, e.g. TERM to shut the daemon down
    async fn shutdown_tor(&self, signal: &str) -> Result<()>;

    /// Close the connection. Later commands fail with ChannelNotOpen.
    async fn close(&self) -> Result<()>;
}

/// Opens control connections
#[async_trait]
pub trait ControlConnector: Send + Sync {
    /// Connect to the control port on localhost.
    ///
    /// Events received on the connection are sent to `events`; the last
    /// event sent is always [`TorEvent::ConnectionClosed`] unless the
    /// connection is closed locally.
    async fn connect(&self, port: u16, events: mpsc::Sender<TorEvent>) -> Result<Arc<dyn ControlChannel>>;
}

/// Connects to a real daemon over TCP
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl ControlConnector for TcpConnector {
    async fn connect(&self, port: u16, events: mpsc::Sender<TorEvent>) -> Result<Arc<dyn ControlChannel>> {
        let port = ControlPort::connect(port, events).await?;
        Ok(Arc::new(port))
    }
}

/// A reply to one command, or one asynchronous event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    /// Reply lines without their status prefix. A data block is appended
    /// to the line that introduced it, joined with newlines.
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn an error status into an error
    pub fn check(self) -> Result<Self> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(Error::Control(format!("{} {}", self.status, self.lines.join(" "))))
        }
    }

    /// Collect the `key=value` lines
    pub fn key_values(&self) -> HashMap<String, String> {
        self.lines
            .iter()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

/// Builds replies from protocol lines
#[derive(Debug, Default)]
struct ReplyAssembler {
    lines: Vec<String>,
    data: Option<Vec<String>>,
}

impl ReplyAssembler {
    /// Feed one line, CRLF already stripped. Returns a reply once its final
    /// line has been seen.
    fn push(&mut self, line: &str) -> Result<Option<Reply>> {
        if let Some(data) = self.data.as_mut() {
            if line == "." {
                let data = data.join("\n");
                self.data = None;
                if let Some(last) = self.lines.last_mut() {
                    last.push_str(&data);
                }
            } else {
                data.push(line.strip_prefix('.').unwrap_or(line).to_string());
            }
            return Ok(None);
        }

        let malformed = || Error::Control(format!("malformed reply line: {:?}", line));
        let status: u16 = line
            .get(..3)
            .and_then(|s| s.parse().ok())
            .ok_or_else(malformed)?;
        let separator = line.as_bytes().get(3).copied().unwrap_or(b' ');
        let text = line.get(4..).unwrap_or_default();
        self.lines.push(text.to_string());

        match separator {
            b' ' => Ok(Some(Reply {
                status,
                lines: std::mem::take(&mut self.lines),
            })),
            b'-' => Ok(None),
            b'+' => {
                self.data = Some(Vec::new());
                Ok(None)
            },
            _ => {
                self.lines.clear();
                Err(malformed())
            },
        }
    }
}

/// Quote a configuration value as a control protocol string
pub fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

/// Build a SETCONF command. Entries are split at their first space into
/// key and value.
pub fn set_conf_command(lines: &[String]) -> String {
    let mut cmd = String::from("SETCONF");
    for line in lines {
        cmd.push(' ');
        match line.split_once(' ') {
            Some((key, value)) => {
                cmd.push_str(key);
                cmd.push('=');
                cmd.push_str(&quote(value));
            },
            None => cmd.push_str(line),
        }
    }
    cmd
}

/// Build an ADD_ONION command
pub fn add_onion_command(key: &str, ports: &[(u16, String)]) -> String {
    let mut cmd = format!("ADD_ONION {}", key);
    for (virtual_port, target) in ports {
        cmd.push_str(&format!(" Port={},{}", virtual_port, target));
    }
    cmd
}

struct Connection {
    writer: Option<OwnedWriteHalf>,
    replies: mpsc::UnboundedReceiver<Reply>,
    /// Commands written whose replies have not been received yet. Above
    /// one only when an earlier caller gave up waiting.
    outstanding: usize,
}

/// Connection to the Tor control port
pub struct ControlPort {
    conn: Mutex<Connection>,
    reader: JoinHandle<()>,
}

impl ControlPort {
    /// Connect to the control port on localhost
    pub async fn connect(port: u16, events: mpsc::Sender<TorEvent>) -> Result<Self> {
        let addr = format!("127.0.0.1:{}", port);
        debug!("Connecting to Tor control port: {}", addr);

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::Control(format!("failed to connect to Tor at {}: {}", addr, e)))?;
        let (read_half, write_half) = stream.into_split();

        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(BufReader::new(read_half), reply_tx, events));

        Ok(Self {
            conn: Mutex::new(Connection {
                writer: Some(write_half),
                replies: reply_rx,
                outstanding: 0,
            }),
            reader,
        })
    }

    /// Send a command and wait for its reply, whatever its status.
    ///
    /// Returns None if the connection closed before the reply arrived.
    /// Cancel-safe once the command is written: replies owed to callers
    /// that stopped waiting are skipped.
    async fn send(&self, cmd: &str) -> Result<Option<Reply>> {
        let mut conn = self.conn.lock().await;
        let writer = conn.writer.as_mut().ok_or(Error::ChannelNotOpen)?;

        // Arguments may carry keys or cookies, so only the keyword is logged
        let keyword = cmd.split(' ').next().unwrap_or_default();
        debug!("Sending Tor command: {}", keyword);

        let line = format!("{}\r\n", cmd);
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Control(format!("writing {}: {}", keyword, e)))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::Control(format!("writing {}: {}", keyword, e)))?;
        conn.outstanding += 1;

        loop {
            let Some(reply) = conn.replies.recv().await else {
                return Ok(None);
            };
            conn.outstanding -= 1;
            if conn.outstanding == 0 {
                return Ok(Some(reply));
            }
            debug!(status = reply.status, "Skipping reply to abandoned command");
        }
    }

    /// Send a command and fail on an error status or a closed connection
    async fn command(&self, cmd: &str) -> Result<Reply> {
        match self.send(cmd).await? {
            Some(reply) => reply.check(),
            None => {
                let keyword = cmd.split(' ').next().unwrap_or_default();
                Err(Error::Control(format!("connection closed before reply to {}", keyword)))
            },
        }
    }
}

impl Drop for ControlPort {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl ControlChannel for ControlPort {
    async fn authenticate(&self, cookie: &[u8]) -> Result<()> {
        let cookie_hex = data_encoding::HEXLOWER.encode(cookie);
        self.command(&format!("AUTHENTICATE {}", cookie_hex)).await?;
        debug!("Authenticated with cookie");
        Ok(())
    }

    async fn take_ownership(&self) -> Result<()> {
        self.command("TAKEOWNERSHIP").await.map(drop)
    }

    async fn reset_conf(&self, keys: &[&str]) -> Result<()> {
        self.command(&format!("RESETCONF {}", keys.join(" ")))
            .await
            .map(drop)
    }

    async fn set_conf_lines(&self, lines: &[String]) -> Result<()> {
        self.command(&set_conf_command(lines)).await.map(drop)
    }

    async fn get_info(&self, key: &str) -> Result<Option<String>> {
        let reply = self.command(&format!("GETINFO {}", key)).await?;
        let prefix = format!("{}=", key);
        Ok(reply
            .lines
            .iter()
            .find_map(|line| line.strip_prefix(&prefix))
            .map(|value| value.to_string()))
    }

    async fn add_onion(&self, key: &str, ports: &[(u16, String)]) -> Result<HashMap<String, String>> {
        let reply = self.command(&add_onion_command(key, ports)).await?;
        Ok(reply.key_values())
    }

    async fn del_onion(&self, service_id: &str) -> Result<()> {
        self.command(&format!("DEL_ONION {}", service_id))
            .await
            .map(drop)
    }

    async fn set_events(&self, events: &[&str]) -> Result<()> {
        self.command(&format!("SETEVENTS {}", events.join(" ")))
            .await
            .map(drop)
    }

    async fn shutdown_tor(&self, signal: &str) -> Result<()> {
        match self.send(&format!("SIGNAL {}", signal)).await? {
            Some(reply) => reply.check().map(drop),
            // The daemon may close the connection before replying
            None => {
                debug!("Tor closed the control connection during shutdown");
                Ok(())
            },
        }
    }

    async fn close(&self) -> Result<()> {
        let writer = self.conn.lock().await.writer.take();
        self.reader.abort();
        if let Some(mut writer) = writer {
            writer
                .shutdown()
                .await
                .map_err(|e| Error::Control(format!("closing control connection: {}", e)))?;
        }
        Ok(())
    }
}

/// Split incoming lines into command replies and events until EOF
async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    replies: mpsc::UnboundedSender<Reply>,
    events: mpsc::Sender<TorEvent>,
) {
    let mut assembler = ReplyAssembler::default();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {},
            Err(e) => {
                debug!("Error reading from control port: {}", e);
                break;
            },
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(&['\r', '\n'][..]);

        match assembler.push(line) {
            Ok(None) => {},
            Ok(Some(reply)) if reply.status == EVENT_STATUS => {
                let event = TorEvent::parse(&reply.lines.join("\n"));
                if events.send(event).await.is_err() {
                    debug!("Event receiver gone, dropping event");
                }
            },
            Ok(Some(reply)) => {
                if replies.send(reply).is_err() {
                    debug!("No command waiting for reply");
                }
            },
            Err(e) => warn!("{}", e),
        }
    }

    // Fail any command still waiting before announcing the close
    drop(replies);
    let _ = events.send(TorEvent::ConnectionClosed).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(lines: &[&str]) -> Vec<Reply> {
        let mut assembler = ReplyAssembler::default();
        lines
            .iter()
            .filter_map(|line| assembler.push(line).unwrap())
            .collect()
    }

    #[test]
    fn test_single_line_reply() {
        let replies = assemble(&["250 OK"]);
        assert_eq!(
            replies,
            vec![Reply {
                status: 250,
                lines: vec!["OK".to_string()]
            }]
        );
    }

    #[test]
    fn test_multi_line_reply() {
        let replies = assemble(&[
            "250-ServiceID=abcdefghijklmnopqrstuvwxyz234567abcdefghijklmnopqrstuvwx",
            "250-PrivateKey=ED25519-V3:c2VjcmV0",
            "250 OK",
        ]);
        assert_eq!(replies.len(), 1);
        let values = replies[0].key_values();
        assert_eq!(values["PrivateKey"], "ED25519-V3:c2VjcmV0");
        assert_eq!(
            values["ServiceID"],
            "abcdefghijklmnopqrstuvwxyz234567abcdefghijklmnopqrstuvwx"
        );
    }

    #[test]
    fn test_data_block() {
        let replies = assemble(&["250+config-text=", "SocksPort 9050", "..dotted", ".", "250 OK"]);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].lines[0], "config-text=SocksPort 9050\n.dotted");
        assert_eq!(replies[0].lines[1], "OK");
    }

    #[test]
    fn test_error_reply() {
        let replies = assemble(&["552 Unrecognized option"]);
        let err = replies[0].clone().check().unwrap_err();
        assert!(matches!(err, Error::Control(ref msg) if msg.contains("552")));
    }

    #[test]
    fn test_malformed_line() {
        let mut assembler = ReplyAssembler::default();
        assert!(assembler.push("hello").is_err());
        assert!(assembler.push("25").is_err());
        // The assembler recovers for the next reply
        assert!(assembler.push("250 OK").unwrap().is_some());
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("a \"b\" c\\d"), "\"a \\\"b\\\" c\\\\d\"");
    }

    #[test]
    fn test_set_conf_command() {
        let cmd = set_conf_command(&[
            "UseBridges 1".to_string(),
            "Bridge obfs4 192.0.2.1:443 FINGERPRINT cert=abc iat-mode=0".to_string(),
            "Bridge 192.0.2.2:9001".to_string(),
        ]);
        assert_eq!(
            cmd,
            "SETCONF UseBridges=\"1\" Bridge=\"obfs4 192.0.2.1:443 FINGERPRINT cert=abc iat-mode=0\" Bridge=\"192.0.2.2:9001\""
        );
        assert_eq!(set_conf_command(&["Bridge".to_string()]), "SETCONF Bridge");
    }

    #[test]
    fn test_add_onion_command() {
        let cmd = add_onion_command("NEW:ED25519-V3", &[(80, "127.0.0.1:8080".to_string())]);
        assert_eq!(cmd, "ADD_ONION NEW:ED25519-V3 Port=80,127.0.0.1:8080");
    }
}
