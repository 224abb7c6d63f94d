//! Tor process supervision
//!
//! Launches the daemon, hands its readiness back to the caller exactly
//! once, keeps draining its output for as long as it runs (a full pipe
//! would stall the daemon) and reports its exit status.
//!
//! stdout and stderr are read by separate tasks into one line stream, so
//! lines keep their order within a pipe but not across the two. The
//! banner is always the first stdout line.

use crate::error::{Error, Result};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Output line that means the control listener is open
pub const READY_MARKER: &str = "Opened Control listener";

/// Tells the daemon which process owns it, so it exits if the owner dies
pub const OWNER_ARG: &str = "__OwningControllerProcess";

/// Size of a complete control auth cookie
pub const COOKIE_LEN: u64 = 32;
pub const COOKIE_TIMEOUT: Duration = Duration::from_millis(3000);
pub const COOKIE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Which pipe an output line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pipe {
    Stdout,
    Stderr,
}

/// How to launch the daemon
#[derive(Debug, Clone)]
pub struct LaunchOptions<'a> {
    pub executable: &'a Path,
    pub config_file: &'a Path,
    /// Pid of the controlling process
    pub owner_pid: u32,
    /// Working directory, also exported as HOME
    pub working_dir: &'a Path,
}

/// Handle to a running daemon.
///
/// The child itself is owned by a background task; this handle only
/// carries the channels to and from that task.
pub struct TorProcess {
    pid: Option<u32>,
    ready: Option<oneshot::Receiver<bool>>,
    kill: Option<oneshot::Sender<()>>,
    exited: Option<oneshot::Receiver<Option<ExitStatus>>>,
}

impl TorProcess {
    /// Start the daemon and its supervising task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(options: &LaunchOptions<'_>) -> Result<Self> {
        let mut command = Command::new(options.executable);
        command
            .arg("-f")
            .arg(options.config_file)
            .arg(OWNER_ARG)
            .arg(options.owner_pid.to_string())
            .env("HOME", options.working_dir)
            .current_dir(options.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            Error::ProcessLaunch(format!("{}: {}", options.executable.display(), e))
        })?;
        let pid = child.id();
        debug!(?pid, "Spawned Tor");

        // stderr is merged into the same line stream as stdout
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, Pipe::Stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, Pipe::Stderr, line_tx);
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(supervise(child, line_rx, ready_tx, kill_rx, exit_tx));

        Ok(Self {
            pid,
            ready: Some(ready_rx),
            kill: Some(kill_tx),
            exited: Some(exit_rx),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Block until the daemon reports its control listener open.
    ///
    /// There is no timeout: the wait ends when the marker appears or the
    /// daemon's output ends.
    pub async fn wait_until_ready(&mut self) -> Result<()> {
        let Some(ready) = self.ready.take() else {
            return Ok(());
        };
        match ready.await {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(Error::StartupFailed),
        }
    }

    /// Ask the supervising task to kill the daemon
    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    /// Wait for the daemon to exit. Unbounded.
    pub async fn wait(mut self) -> Option<ExitStatus> {
        let exited = self.exited.take()?;
        exited.await.ok().flatten()
    }
}

/// Read lines from one of the child's pipes until it closes
fn forward_lines<R>(reader: R, pipe: Pipe, tx: mpsc::UnboundedSender<(Pipe, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(&['\r', '\n'][..])
                        .to_string();
                    if tx.send((pipe, line)).is_err() {
                        break;
                    }
                },
                Err(e) => {
                    debug!("Error reading Tor output: {}", e);
                    break;
                },
            }
        }
    });
}

/// Scan output for readiness, drain it to the end, then report the exit
async fn supervise(
    mut child: Child,
    mut lines: mpsc::UnboundedReceiver<(Pipe, String)>,
    ready_tx: oneshot::Sender<bool>,
    mut kill_rx: oneshot::Receiver<()>,
    exit_tx: oneshot::Sender<Option<ExitStatus>>,
) {
    let mut ready_tx = Some(ready_tx);

    let scan = async {
        // The first stdout line carries the Tor and library versions
        let mut banner_seen = false;
        while let Some((pipe, line)) = lines.recv().await {
            if pipe == Pipe::Stdout && !banner_seen {
                banner_seen = true;
                info!("{}", line);
                continue;
            }
            debug!(target: "onionwrapper::tor::output", ?pipe, "{}", line);
            if line.contains(READY_MARKER) {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(true);
                }
            }
        }
        if let Some(tx) = ready_tx.take() {
            let _ = tx.send(false);
        }
    };

    let exit = async {
        tokio::select! {
            status = child.wait() => status,
            Ok(()) = &mut kill_rx => {
                info!("Killing Tor");
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill Tor: {}", e);
                }
                child.wait().await
            },
        }
    };

    let ((), status) = tokio::join!(scan, exit);
    let status = match status {
        Ok(status) => {
            info!("Tor exited with {}", status);
            Some(status)
        },
        Err(e) => {
            warn!("Failed to wait for Tor to exit: {}", e);
            None
        },
    };
    let _ = exit_tx.send(status);
}

/// Remove the cookie a previous daemon left behind
pub async fn delete_stale_cookie(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Deleted old auth cookie"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => warn!("Old auth cookie not deleted: {}", e),
    }
}

/// Poll until the cookie file has reached its full size
pub async fn wait_for_cookie(path: &Path, timeout: Duration, poll_interval: Duration) -> Result<()> {
    let start = Instant::now();
    while cookie_len(path).await < COOKIE_LEN {
        if start.elapsed() > timeout {
            return Err(Error::ReadinessTimeout(format!(
                "auth cookie {} not created within {:?}",
                path.display(),
                timeout
            )));
        }
        tokio::time::sleep(poll_interval).await;
    }
    info!("Auth cookie created");
    Ok(())
}

async fn cookie_len(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .unwrap_or(0)
}
