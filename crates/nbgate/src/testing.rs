//! Test doubles shared by unit tests.

use std::net::TcpListener;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::error::RuntimeResult;
use crate::process::{LaunchSpec, ProcessLauncher};

/// Launches `sleep 30` in place of a real backend. When `bind` is set it
/// also listens on the `--port` argument so readiness polling succeeds.
#[derive(Debug, Default)]
pub struct FakeLauncher {
    bind: bool,
    launches: AtomicUsize,
    specs: Mutex<Vec<LaunchSpec>>,
    pids: Mutex<Vec<u32>>,
    listeners: Mutex<Vec<TcpListener>>,
}

impl FakeLauncher {
    /// Backends that become reachable.
    pub fn binding() -> Arc<Self> {
        Arc::new(Self {
            bind: true,
            ..Self::default()
        })
    }

    /// Backends that never open their port.
    pub fn silent() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn last_spec(&self) -> Option<LaunchSpec> {
        self.specs.lock().unwrap().last().cloned()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.pids.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> RuntimeResult<Child> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.specs.lock().unwrap().push(spec.clone());
        // Widen the window for concurrent callers.
        tokio::time::sleep(Duration::from_millis(20)).await;

        if self.bind
            && let Some(port) = port_arg(&spec.args)
        {
            let listener = TcpListener::bind(("127.0.0.1", port))?;
            self.listeners.lock().unwrap().push(listener);
        }

        let child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(pid) = child.id() {
            self.pids.lock().unwrap().push(pid);
        }
        Ok(child)
    }
}

/// Value following `--port` in an argument list.
pub fn port_arg(args: &[String]) -> Option<u16> {
    args.windows(2)
        .find(|pair| pair[0] == "--port")
        .and_then(|pair| pair[1].parse().ok())
}

/// Poll `check` every 20ms until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
