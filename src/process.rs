//! Capability wrapper around a spawned backend process
//!
//! Components only ever see [`ProcessHandle`]: they can ask whether the
//! process is still running, ask it to stop, or kill it. The native child
//! handle stays private to this module.

use parking_lot::Mutex;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Interval for polling process exit during graceful termination (in milliseconds)
const EXIT_POLL_INTERVAL_MS: u64 = 50;

/// How a call to [`ProcessHandle::terminate`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Process had already exited before the stop signal
    AlreadyExited,
    /// Process exited within the grace period
    Graceful,
    /// Grace period elapsed and the process was killed
    Killed,
}

pub struct ProcessHandle {
    child: Mutex<Child>,
    pid: Option<u32>,
}

impl ProcessHandle {
    /// Spawn `command`, forwarding its stdout/stderr into the log under `label`
    pub fn spawn(mut command: Command, label: &str) -> std::io::Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, label.to_string(), false);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, label.to_string(), true);
        }
        Ok(Self::from_child(child))
    }

    /// Wrap an already spawned child
    pub fn from_child(child: Child) -> Self {
        let pid = child.id();
        Self {
            child: Mutex::new(child),
            pid,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking liveness check
    pub fn is_running(&self) -> bool {
        matches!(self.child.lock().try_wait(), Ok(None))
    }

    /// Exit status if the process has exited
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.child.lock().try_wait().ok().flatten()
    }

    /// Force-kill the process. Errors are logged, never returned.
    pub fn kill(&self) {
        if let Err(e) = self.child.lock().start_kill() {
            // InvalidInput means the child was already reaped
            if e.kind() != std::io::ErrorKind::InvalidInput {
                warn!(pid = ?self.pid, error = %e, "Failed to kill backend process");
            }
        }
    }

    /// Send SIGTERM, wait up to `grace_period`, then SIGKILL if still running
    pub async fn terminate(&self, grace_period: Duration) -> StopOutcome {
        if !self.is_running() {
            return StopOutcome::AlreadyExited;
        }

        self.signal_stop();

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if let Some(status) = self.exit_status() {
                info!(pid = ?self.pid, ?status, "Backend process exited gracefully");
                return StopOutcome::Graceful;
            }
            tokio::time::sleep(Duration::from_millis(EXIT_POLL_INTERVAL_MS)).await;
        }

        if !self.is_running() {
            return StopOutcome::Graceful;
        }

        warn!(
            pid = ?self.pid,
            grace_period_secs = grace_period.as_secs(),
            "Grace period exceeded, sending SIGKILL"
        );
        self.kill();

        // Reap so the pid does not linger as a zombie
        let reap_deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < reap_deadline && self.is_running() {
            tokio::time::sleep(Duration::from_millis(EXIT_POLL_INTERVAL_MS)).await;
        }
        StopOutcome::Killed
    }

    fn signal_stop(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            debug!(pid, "Sending SIGTERM to backend");
            let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                warn!(pid, error = %err, "Failed to send SIGTERM");
            }
            return;
        }

        self.kill();
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle").field("pid", &self.pid).finish()
    }
}

fn forward_output<R>(reader: R, label: String, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                warn!(session = %label, "{}", line);
            } else {
                info!(session = %label, "{}", line);
            }
        }
    });
}
