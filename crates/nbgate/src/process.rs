//! Process launching and supervision shared by runtimes and sync servers.
//!
//! A launched child is wrapped in a [`Supervisor`], which owns the child on a
//! background task, logs its output, and records how it exited. Stops go
//! through the supervisor so an exit can always be classified as requested or
//! unexpected.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{RuntimeError, RuntimeResult};

/// What to launch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Logical name used in logs (session name, sync key).
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

/// Starts OS processes. Swapped out in tests.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> RuntimeResult<Child>;
}

/// Launches processes with `tokio::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandLauncher;

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> RuntimeResult<Child> {
        debug!("Spawning {} for {}: {:?}", spec.program, spec.name, spec.args);

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        cmd.spawn().map_err(|e| RuntimeError::Spawn {
            name: spec.name.clone(),
            message: format!("{}: {}", spec.program, e),
        })
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Whether a stop was requested before the process exited.
    pub expected: bool,
}

impl ExitInfo {
    fn from_status(status: std::io::Result<std::process::ExitStatus>, expected: bool) -> Self {
        match status {
            Ok(status) => {
                #[cfg(unix)]
                let signal = {
                    use std::os::unix::process::ExitStatusExt;
                    status.signal()
                };
                #[cfg(not(unix))]
                let signal = None;
                Self {
                    code: status.code(),
                    signal,
                    expected,
                }
            }
            Err(e) => {
                warn!("Error waiting for process exit: {:?}", e);
                Self {
                    code: None,
                    signal: None,
                    expected,
                }
            }
        }
    }

    /// Human-readable exit reason.
    pub fn describe(&self) -> String {
        format_exit_status(self.code, self.signal)
    }
}

/// Format exit status as a human-readable string.
pub fn format_exit_status(exit_code: Option<i32>, signal: Option<i32>) -> String {
    match (exit_code, signal) {
        (Some(code), _) => format!("exited with code {}", code),
        (None, Some(sig)) => {
            let sig_name = match sig {
                9 => "SIGKILL",
                15 => "SIGTERM",
                11 => "SIGSEGV",
                6 => "SIGABRT",
                _ => "",
            };
            if sig_name.is_empty() {
                format!("killed by signal {}", sig)
            } else {
                format!("killed by {} (signal {})", sig_name, sig)
            }
        }
        (None, None) => "exited (unknown status)".to_string(),
    }
}

/// Owns a running child on a background task.
///
/// Cloning yields another handle to the same process.
#[derive(Clone)]
pub struct Supervisor {
    pid: u32,
    service: String,
    cancel: CancellationToken,
    expected: Arc<AtomicBool>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("pid", &self.pid)
            .field("service", &self.service)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Supervisor {
    /// Take ownership of `child`. On a stop request the child gets SIGTERM,
    /// then SIGKILL once `grace` has elapsed.
    ///
    /// Returns `None` if the child has already been reaped and has no pid.
    pub fn spawn(mut child: Child, service: impl Into<String>, grace: Duration) -> Option<Self> {
        let pid = child.id()?;
        let service = service.into();
        let cancel = CancellationToken::new();
        let expected = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = watch::channel(None);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(log_lines(stdout, format!("{service} stdout"), false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_lines(stderr, format!("{service} stderr"), true));
        }

        let task_cancel = cancel.clone();
        let task_expected = Arc::clone(&expected);
        let task_service = service.clone();
        tokio::spawn(async move {
            enum Outcome {
                Exited(std::io::Result<std::process::ExitStatus>),
                StopRequested,
            }

            let outcome = tokio::select! {
                status = child.wait() => Outcome::Exited(status),
                _ = task_cancel.cancelled() => Outcome::StopRequested,
            };

            let status = match outcome {
                Outcome::Exited(status) => status,
                Outcome::StopRequested => {
                    debug!("Stopping {} (PID {})", task_service, pid);
                    terminate_pid(pid);
                    match tokio::time::timeout(grace, child.wait()).await {
                        Ok(status) => status,
                        Err(_) => {
                            warn!(
                                "{} (PID {}) ignored SIGTERM for {:?}, killing",
                                task_service, pid, grace
                            );
                            if let Err(e) = child.kill().await {
                                warn!("Failed to kill {} (PID {}): {:?}", task_service, pid, e);
                            }
                            child.wait().await
                        }
                    }
                }
            };

            let info = ExitInfo::from_status(status, task_expected.load(Ordering::SeqCst));
            if info.expected {
                info!("{} (PID {}) {}", task_service, pid, info.describe());
            } else {
                warn!(
                    "{} (PID {}) {} without a stop request",
                    task_service,
                    pid,
                    info.describe()
                );
            }
            let _ = exit_tx.send(Some(info));
        });

        Some(Self {
            pid,
            service,
            cancel,
            expected,
            exit: exit_rx,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Check if the process is still running.
    pub fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// Mark the upcoming exit as requested and signal the process.
    pub fn request_stop(&self) {
        self.expected.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Wait until the process has exited.
    pub async fn wait(&self) -> ExitInfo {
        let mut rx = self.exit.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(info) = current {
                return info;
            }
            if rx.changed().await.is_err() {
                return ExitInfo {
                    code: None,
                    signal: None,
                    expected: self.expected.load(Ordering::SeqCst),
                };
            }
        }
    }

    /// Request a stop and wait for the exit.
    pub async fn stop(&self) -> ExitInfo {
        self.request_stop();
        self.wait().await
    }
}

async fn log_lines<R>(reader: R, label: String, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        if is_stderr {
            warn!("{}: {}", label, line);
        } else {
            debug!("{}: {}", label, line);
        }
    }
}

/// Ask the OS for a free TCP port on `host`.
pub fn allocate_port(host: &str) -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind((host, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Check if a port is available for binding.
pub fn is_port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Poll until `host:port` accepts a TCP connection or `timeout` elapses.
pub async fn wait_for_port(host: &str, port: u16, timeout: Duration) -> bool {
    use tokio::net::TcpStream;
    use tokio::time::{Instant, sleep};

    let deadline = Instant::now() + timeout;
    loop {
        if TcpStream::connect((host, port)).await.is_ok() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(100)).await;
    }
}

/// Whether a process with this PID exists at the OS level.
#[cfg(unix)]
pub fn is_pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 performs the permission and existence checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_pid_alive(_pid: u32) -> bool {
    false
}

/// Send SIGTERM. Returns false if the signal could not be delivered.
#[cfg(unix)]
pub fn terminate_pid(pid: u32) -> bool {
    send_signal(pid, libc::SIGTERM)
}

/// Send SIGKILL. Returns false if the signal could not be delivered.
#[cfg(unix)]
pub fn force_kill_pid(pid: u32) -> bool {
    send_signal(pid, libc::SIGKILL)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) -> bool {
    match i32::try_from(pid) {
        Ok(pid) if pid > 0 => unsafe { libc::kill(pid, signal) == 0 },
        _ => false,
    }
}

#[cfg(not(unix))]
pub fn terminate_pid(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
pub fn force_kill_pid(_pid: u32) -> bool {
    false
}
