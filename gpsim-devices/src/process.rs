//! Subprocess supervision shared by the external-tool adapters
//!
//! A [`Supervised`] child keeps the last few stderr lines for error reports
//! and knows how to shut down politely: SIGTERM, a grace period, then SIGKILL.
//! Every exit path reaps the child, so once `wait`/`terminate` returns the
//! process is gone and the radio it held is free again.

use gpsim_core::DeviceError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// stderr lines kept for error messages
const TAIL_LINES: usize = 20;

/// How long to wait for the stderr reader after the child exits
const STDERR_DRAIN: Duration = Duration::from_secs(1);

pub struct Supervised {
    tool: String,
    child: Child,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_task: Option<JoinHandle<()>>,
    exited: Option<ExitStatus>,
}

impl Supervised {
    /// Spawn `cmd` with stderr captured and stdout discarded
    ///
    /// stdin is left as configured by the caller.
    pub fn spawn(tool: &str, mut cmd: Command) -> Result<Self, DeviceError> {
        cmd.stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| DeviceError::Launch {
            tool: tool.to_string(),
            source,
        })?;
        info!(tool, pid = ?child.id(), "Spawned subprocess");

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(TAIL_LINES)));
        let stderr_task = child.stderr.take().map(|stderr| {
            let tail = stderr_tail.clone();
            let tool = tool.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(tool = %tool, "{}", line);
                    let mut tail = tail.lock();
                    if tail.len() == TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            })
        });

        Ok(Self {
            tool: tool.to_string(),
            child,
            stderr_tail,
            stderr_task,
            exited: None,
        })
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    /// Last stderr lines, oldest first
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail
            .lock()
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn is_alive(&mut self) -> bool {
        if self.exited.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.exited = Some(status);
                false
            }
            Err(e) => {
                warn!(tool = %self.tool, "try_wait failed: {}", e);
                false
            }
        }
    }

    /// Wait for the child to exit on its own
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.exited {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.exited = Some(status);
        self.drain_stderr().await;
        debug!(tool = %self.tool, ?status, "Subprocess exited");
        Ok(status)
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL; always reaps the child
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        if !self.is_alive() {
            return self.wait().await;
        }

        if send_sigterm(&self.child) {
            debug!(tool = %self.tool, "Sent SIGTERM");
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(status) => {
                    let status = status?;
                    self.exited = Some(status);
                    self.drain_stderr().await;
                    info!(tool = %self.tool, ?status, "Subprocess terminated");
                    return Ok(status);
                }
                Err(_) => {
                    warn!(
                        tool = %self.tool,
                        "Subprocess ignored SIGTERM for {:?}, killing",
                        grace
                    );
                }
            }
        }

        self.child.kill().await?;
        let status = self.child.wait().await?;
        self.exited = Some(status);
        self.drain_stderr().await;
        info!(tool = %self.tool, ?status, "Subprocess killed");
        Ok(status)
    }

    /// Error describing a non-zero exit, including the stderr tail
    pub fn failure(&self, status: ExitStatus) -> DeviceError {
        DeviceError::ProcessFailed {
            tool: self.tool.clone(),
            code: status.code(),
            detail: self.stderr_tail(),
        }
    }

    async fn drain_stderr(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            // a grandchild may keep the pipe open
            let _ = tokio::time::timeout(STDERR_DRAIN, task).await;
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    // SAFETY: `pid` is our own child and has not been reaped yet (id() is
    // None after reaping), so it cannot refer to a recycled process.
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_wait_captures_stderr_tail() {
        let mut proc = Supervised::spawn("sh", sh("echo first >&2; echo second >&2; exit 3")).unwrap();
        let status = proc.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
        assert_eq!(proc.stderr_tail(), "first\nsecond");
        assert!(!proc.is_alive());

        match proc.failure(status) {
            DeviceError::ProcessFailed { tool, code, detail } => {
                assert_eq!(tool, "sh");
                assert_eq!(code, Some(3));
                assert!(detail.contains("second"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminate_graceful() {
        let mut proc = Supervised::spawn("sleep", {
            let mut cmd = Command::new("sleep");
            cmd.arg("30");
            cmd
        })
        .unwrap();
        assert!(proc.is_alive());
        proc.terminate(Duration::from_secs(5)).await.unwrap();
        assert!(!proc.is_alive());
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let mut proc = Supervised::spawn("sh", sh("trap '' TERM; sleep 30")).unwrap();
        // give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = std::time::Instant::now();
        proc.terminate(Duration::from_millis(300)).await.unwrap();
        assert!(!proc.is_alive());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_launch_error() {
        let err = Supervised::spawn("missing", Command::new("/nonexistent/gpsim-tool"))
            .err()
            .expect("spawn should fail");
        assert!(matches!(err, DeviceError::Launch { .. }));
    }
}
