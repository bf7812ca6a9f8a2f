//! Per-project document sync server manager.
//!
//! One sync server serves every open document of a project. Handles are
//! reference counted: `acquire` increments, `release` decrements, and an
//! owned server is terminated when its count reaches zero. A server found
//! through its liveness marker is adopted unowned and never terminated by
//! this instance.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use nbgate_protocol::SyncEvent;
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};

use super::marker::{SyncMarker, marker_path, read_marker, remove_marker, write_marker};
use crate::config::SyncConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::inflight::InFlight;
use crate::paths::{canonical, dir_hash};
use crate::process::{
    ExitInfo, LaunchSpec, ProcessLauncher, Supervisor, allocate_port, is_pid_alive, wait_for_port,
};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub binary: String,
    /// Argument template; `{port}`, `{project_dir}` and `{memory_mb}` are substituted.
    pub args: Vec<String>,
    pub memory_limit_mb: u64,
    pub startup_timeout: Duration,
    pub host: String,
    pub stop_grace: Duration,
    /// Root for liveness markers.
    pub state_dir: PathBuf,
}

impl SyncOptions {
    pub fn from_config(config: &SyncConfig, state_dir: PathBuf) -> Self {
        Self {
            binary: config.binary.clone(),
            args: config.args.clone(),
            memory_limit_mb: config.memory_limit_mb,
            startup_timeout: Duration::from_secs(config.startup_timeout_secs),
            host: config.host.clone(),
            stop_grace: Duration::from_millis(config.stop_grace_ms),
            state_dir,
        }
    }
}

/// Read-only view of a sync server handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncServerInfo {
    pub dir_hash: String,
    pub project_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub ref_count: usize,
    /// Whether this instance may terminate the server.
    pub owned: bool,
}

impl SyncServerInfo {
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

struct SyncHandle {
    project_dir: PathBuf,
    dir_hash: String,
    port: u16,
    pid: Option<u32>,
    ref_count: usize,
    owned: bool,
    process: Option<Supervisor>,
}

impl SyncHandle {
    fn info(&self, host: &str) -> SyncServerInfo {
        SyncServerInfo {
            dir_hash: self.dir_hash.clone(),
            project_dir: self.project_dir.clone(),
            host: host.to_string(),
            port: self.port,
            pid: self.pid,
            ref_count: self.ref_count,
            owned: self.owned,
        }
    }
}

struct ManagerInner {
    options: SyncOptions,
    launcher: Arc<dyn ProcessLauncher>,
    handles: Mutex<HashMap<String, SyncHandle>>,
    establishing: InFlight<SyncServerInfo>,
    events: broadcast::Sender<SyncEvent>,
}

/// Reference-counted pool of per-project sync servers.
#[derive(Clone)]
pub struct SyncServerManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for SyncServerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServerManager")
            .field("options", &self.inner.options)
            .finish()
    }
}

impl SyncServerManager {
    pub fn new(options: SyncOptions, launcher: Arc<dyn ProcessLauncher>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                options,
                launcher,
                handles: Mutex::new(HashMap::new()),
                establishing: InFlight::new(),
                events,
            }),
        }
    }

    /// Register for lifecycle events, including death notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn host(&self) -> &str {
        &self.inner.options.host
    }

    /// Take a reference on the project's sync server, starting or adopting
    /// one if needed.
    pub async fn acquire(&self, project_dir: &Path) -> RuntimeResult<SyncServerInfo> {
        let project_dir = canonical(project_dir);
        let hash = dir_hash(&project_dir);

        if let Some(info) = self.increment(&hash).await {
            return Ok(info);
        }

        let this = self.clone();
        let key = hash.clone();
        self.inner
            .establishing
            .run(&hash, move || async move { this.establish(project_dir, key).await })
            .await?;

        self.increment(&hash)
            .await
            .ok_or_else(|| RuntimeError::UnexpectedExit {
                name: format!("sync-{hash}"),
                reason: "sync server went away during startup".to_string(),
            })
    }

    async fn increment(&self, hash: &str) -> Option<SyncServerInfo> {
        let mut handles = self.inner.handles.lock().await;
        let handle = handles.get_mut(hash)?;
        handle.ref_count += 1;
        debug!(
            "Sync server for {} now has {} reference(s)",
            handle.project_dir.display(),
            handle.ref_count
        );
        Some(handle.info(self.host()))
    }

    /// Find or create the handle for `hash` with a zero count.
    async fn establish(&self, project_dir: PathBuf, hash: String) -> RuntimeResult<SyncServerInfo> {
        if let Some(handle) = self.inner.handles.lock().await.get(&hash) {
            return Ok(handle.info(self.host()));
        }

        let marker = marker_path(&self.inner.options.state_dir, &hash);
        if let Some(existing) = read_marker(&marker) {
            if is_pid_alive(existing.pid) {
                info!(
                    "Adopting sync server for {} (PID {}, port {})",
                    project_dir.display(),
                    existing.pid,
                    existing.port
                );
                let handle = SyncHandle {
                    project_dir: project_dir.clone(),
                    dir_hash: hash.clone(),
                    port: existing.port,
                    pid: Some(existing.pid),
                    ref_count: 0,
                    owned: false,
                    process: None,
                };
                let info = handle.info(self.host());
                self.inner.handles.lock().await.insert(hash, handle);
                self.emit(SyncEvent::Adopted {
                    project_dir: project_dir.display().to_string(),
                    port: existing.port,
                    pid: existing.pid,
                });
                return Ok(info);
            }
            debug!("Removing stale sync marker {}", marker.display());
            remove_marker(&marker, None);
        }

        self.spawn_owned(project_dir, hash, marker).await
    }

    async fn spawn_owned(
        &self,
        project_dir: PathBuf,
        hash: String,
        marker: PathBuf,
    ) -> RuntimeResult<SyncServerInfo> {
        let options = &self.inner.options;
        let name = format!("sync-{hash}");
        let port = allocate_port(&options.host)?;
        let spec = LaunchSpec {
            name: name.clone(),
            program: options.binary.clone(),
            args: render_args(&options.args, port, &project_dir, options.memory_limit_mb),
            cwd: Some(project_dir.clone()),
            env: HashMap::new(),
        };

        info!(
            "Starting sync server for {} on port {} (memory limit {} MB)",
            project_dir.display(),
            port,
            options.memory_limit_mb
        );
        let child = self.inner.launcher.launch(&spec).await?;
        let supervisor = Supervisor::spawn(child, &name, options.stop_grace).ok_or_else(|| {
            RuntimeError::Spawn {
                name: name.clone(),
                message: "process exited before it could be tracked".to_string(),
            }
        })?;
        let pid = supervisor.pid();

        let ready = tokio::select! {
            ready = wait_for_port(&options.host, port, options.startup_timeout) => Ok(ready),
            exit = supervisor.wait() => Err(exit),
        };
        match ready {
            Ok(true) => {}
            Ok(false) => {
                warn!("Sync server {} not reachable on port {}, killing PID {}", name, port, pid);
                supervisor.stop().await;
                return Err(RuntimeError::StartupTimeout {
                    name,
                    port,
                    timeout_secs: options.startup_timeout.as_secs(),
                });
            }
            Err(exit) => {
                return Err(RuntimeError::UnexpectedExit {
                    name,
                    reason: exit.describe(),
                });
            }
        }

        if let Err(e) = write_marker(&marker, SyncMarker { pid, port }) {
            warn!("Failed to write sync marker {}: {}", marker.display(), e);
        }

        let handle = SyncHandle {
            project_dir: project_dir.clone(),
            dir_hash: hash.clone(),
            port,
            pid: Some(pid),
            ref_count: 0,
            owned: true,
            process: Some(supervisor.clone()),
        };
        let info = handle.info(self.host());
        self.inner.handles.lock().await.insert(hash.clone(), handle);
        self.watch_exit(hash, project_dir.clone(), marker, supervisor);

        self.emit(SyncEvent::Started {
            project_dir: project_dir.display().to_string(),
            port,
            pid,
        });
        Ok(info)
    }

    fn watch_exit(&self, hash: String, project_dir: PathBuf, marker: PathBuf, supervisor: Supervisor) {
        let this = self.clone();
        tokio::spawn(async move {
            let info = supervisor.wait().await;
            this.on_exit(&hash, &project_dir, &marker, supervisor.pid(), info)
                .await;
        });
    }

    async fn on_exit(&self, hash: &str, project_dir: &Path, marker: &Path, pid: u32, exit: ExitInfo) {
        {
            let mut handles = self.inner.handles.lock().await;
            if handles.get(hash).is_some_and(|h| h.pid == Some(pid)) {
                handles.remove(hash);
            }
        }
        remove_marker(marker, Some(pid));

        let project_dir = project_dir.display().to_string();
        if exit.expected {
            info!("Sync server for {} stopped", project_dir);
            self.emit(SyncEvent::Stopped { project_dir });
        } else {
            warn!(
                "Sync server for {} (PID {}) {}; unsaved document state may be lost",
                project_dir,
                pid,
                exit.describe()
            );
            self.emit(SyncEvent::Died {
                project_dir,
                exit_code: exit.code,
                signal: exit.signal,
                reason: exit.describe(),
            });
        }
    }

    /// Drop a reference. Unknown projects and handles nobody holds are not
    /// an error.
    ///
    /// Returns whether a reference was dropped.
    pub async fn release(&self, project_dir: &Path) -> bool {
        let hash = dir_hash(project_dir);
        let process = {
            let mut handles = self.inner.handles.lock().await;
            let Some(handle) = handles.get_mut(&hash) else {
                debug!("Release for unknown sync server {}", project_dir.display());
                return false;
            };
            // A handle is inserted with no references before its first
            // acquire counts; releasing it then must not stop the server.
            if handle.ref_count == 0 {
                debug!(
                    "Release for sync server {} with no references; ignoring",
                    handle.project_dir.display()
                );
                return false;
            }
            handle.ref_count -= 1;
            if handle.ref_count > 0 {
                return true;
            }

            if !handle.owned {
                debug!(
                    "Last reference to adopted sync server for {} dropped; leaving it running",
                    handle.project_dir.display()
                );
                handles.remove(&hash);
                return true;
            }
            handles.remove(&hash).and_then(|handle| handle.process)
        };

        if let Some(process) = process {
            info!(
                "Last reference released, stopping sync server for {} (PID {})",
                project_dir.display(),
                process.pid()
            );
            process.request_stop();
        }
        true
    }

    /// Snapshot of the handle for `project_dir`.
    pub async fn get(&self, project_dir: &Path) -> Option<SyncServerInfo> {
        let hash = dir_hash(project_dir);
        self.inner
            .handles
            .lock()
            .await
            .get(&hash)
            .map(|handle| handle.info(self.host()))
    }

    /// Snapshot of every handle, sorted by project directory.
    pub async fn list(&self) -> Vec<SyncServerInfo> {
        let mut servers: Vec<SyncServerInfo> = self
            .inner
            .handles
            .lock()
            .await
            .values()
            .map(|handle| handle.info(self.host()))
            .collect();
        servers.sort_by(|a, b| a.project_dir.cmp(&b.project_dir));
        servers
    }

    /// Stop every owned server and forget adopted ones. Used on shutdown.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<SyncHandle> = self.inner.handles.lock().await.drain().map(|(_, h)| h).collect();
        let mut stopped = 0;
        for handle in drained {
            if let Some(process) = handle.process {
                process.stop().await;
                stopped += 1;
            }
        }
        stopped
    }
}

fn render_args(template: &[String], port: u16, project_dir: &Path, memory_mb: u64) -> Vec<String> {
    let dir = project_dir.to_string_lossy();
    template
        .iter()
        .map(|arg| {
            arg.replace("{port}", &port.to_string())
                .replace("{project_dir}", &dir)
                .replace("{memory_mb}", &memory_mb.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::is_pid_alive;
    use crate::testing::{FakeLauncher, eventually};

    fn manager(state_dir: &Path, launcher: Arc<FakeLauncher>) -> SyncServerManager {
        let options = SyncOptions {
            startup_timeout: Duration::from_secs(2),
            stop_grace: Duration::from_secs(1),
            ..SyncOptions::from_config(&SyncConfig::default(), state_dir.to_path_buf())
        };
        SyncServerManager::new(options, launcher)
    }

    fn project(tmp: &tempfile::TempDir) -> PathBuf {
        let dir = tmp.path().join("proj");
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_refcount_controls_lifetime() {
        let tmp = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::binding();
        let mgr = manager(&tmp.path().join("state"), launcher.clone());
        let proj = project(&tmp);
        let mut events = mgr.subscribe();

        let first = mgr.acquire(&proj).await.unwrap();
        let second = mgr.acquire(&proj).await.unwrap();
        assert_eq!(launcher.launches(), 1);
        assert_eq!(first.port, second.port);
        assert_eq!(second.ref_count, 2);
        assert!(second.owned);
        let pid = second.pid.unwrap();
        assert!(matches!(events.recv().await.unwrap(), SyncEvent::Started { .. }));

        assert!(mgr.release(&proj).await);
        assert_eq!(mgr.get(&proj).await.unwrap().ref_count, 1);
        assert!(is_pid_alive(pid));

        assert!(mgr.release(&proj).await);
        assert!(mgr.get(&proj).await.is_none());
        assert!(eventually(Duration::from_secs(3), move || async move { !is_pid_alive(pid) }).await);
        assert!(matches!(events.recv().await.unwrap(), SyncEvent::Stopped { .. }));

        // Further releases are harmless.
        assert!(!mgr.release(&proj).await);
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test]
    async fn test_release_before_first_acquire_keeps_server() {
        let tmp = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::binding();
        let mgr = manager(&tmp.path().join("state"), launcher.clone());
        let proj = canonical(&project(&tmp));

        // Started but not yet counted, as in the middle of an acquire.
        let info = mgr.establish(proj.clone(), dir_hash(&proj)).await.unwrap();
        assert_eq!(info.ref_count, 0);
        let pid = info.pid.unwrap();

        assert!(!mgr.release(&proj).await);
        assert!(mgr.get(&proj).await.is_some());
        assert!(is_pid_alive(pid));

        let held = mgr.acquire(&proj).await.unwrap();
        assert_eq!(held.pid, Some(pid));
        assert_eq!(held.ref_count, 1);
        assert_eq!(launcher.launches(), 1);

        assert!(mgr.release(&proj).await);
        assert!(eventually(Duration::from_secs(3), move || async move { !is_pid_alive(pid) }).await);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_share_one_process() {
        let tmp = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::binding();
        let mgr = manager(&tmp.path().join("state"), launcher.clone());
        let proj = project(&tmp);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let mgr = mgr.clone();
            let proj = proj.clone();
            handles.push(tokio::spawn(async move { mgr.acquire(&proj).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(launcher.launches(), 1);
        assert_eq!(mgr.get(&proj).await.unwrap().ref_count, 5);
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn test_adopted_server_is_never_terminated() {
        let tmp = tempfile::tempdir().unwrap();
        let state_dir = tmp.path().join("state");
        let proj = project(&tmp);

        // A process left running by an earlier gateway instance.
        let mut survivor = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = survivor.id().unwrap();
        let marker = marker_path(&state_dir, &dir_hash(&proj));
        write_marker(&marker, SyncMarker { pid, port: 7123 }).unwrap();

        let launcher = FakeLauncher::binding();
        let mgr = manager(&state_dir, launcher.clone());
        let mut events = mgr.subscribe();

        let info = mgr.acquire(&proj).await.unwrap();
        assert!(!info.owned);
        assert_eq!(info.port, 7123);
        assert_eq!(info.pid, Some(pid));
        assert_eq!(launcher.launches(), 0);
        assert!(matches!(events.recv().await.unwrap(), SyncEvent::Adopted { .. }));

        mgr.acquire(&proj).await.unwrap();
        mgr.release(&proj).await;
        mgr.release(&proj).await;
        mgr.release(&proj).await;
        assert_eq!(mgr.shutdown().await, 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(is_pid_alive(pid));
        assert!(marker.exists());
        survivor.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_marker_starts_new_server() {
        let tmp = tempfile::tempdir().unwrap();
        let state_dir = tmp.path().join("state");
        let proj = project(&tmp);

        let mut gone = tokio::process::Command::new("true").spawn().unwrap();
        let dead_pid = gone.id().unwrap();
        gone.wait().await.unwrap();
        let marker = marker_path(&state_dir, &dir_hash(&proj));
        write_marker(&marker, SyncMarker { pid: dead_pid, port: 7124 }).unwrap();

        let launcher = FakeLauncher::binding();
        let mgr = manager(&state_dir, launcher.clone());
        let info = mgr.acquire(&proj).await.unwrap();

        assert!(info.owned);
        assert_eq!(launcher.launches(), 1);
        assert_eq!(read_marker(&marker).map(|m| m.pid), info.pid);
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn test_unexpected_exit_broadcasts_death() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp.path().join("state"), FakeLauncher::binding());
        let proj = project(&tmp);
        let mut events = mgr.subscribe();

        let info = mgr.acquire(&proj).await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), SyncEvent::Started { .. }));

        crate::process::force_kill_pid(info.pid.unwrap());
        let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SyncEvent::Died {
                project_dir,
                signal,
                exit_code,
                reason,
            } => {
                assert_eq!(project_dir, canonical(&proj).display().to_string());
                assert_eq!(signal, Some(9));
                assert_eq!(exit_code, None);
                assert!(reason.contains("SIGKILL"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(mgr.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_launch_args_are_rendered() {
        let tmp = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::binding();
        let mgr = manager(&tmp.path().join("state"), launcher.clone());
        let proj = project(&tmp);

        let info = mgr.acquire(&proj).await.unwrap();
        let spec = launcher.last_spec().unwrap();
        assert_eq!(spec.program, "nbgate-sync");
        assert_eq!(
            spec.args,
            vec![
                "--port".to_string(),
                info.port.to_string(),
                "--dir".to_string(),
                canonical(&proj).display().to_string(),
                "--max-memory-mb".to_string(),
                "512".to_string(),
            ]
        );
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn test_startup_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::silent();
        let options = SyncOptions {
            startup_timeout: Duration::from_millis(300),
            ..SyncOptions::from_config(&SyncConfig::default(), tmp.path().join("state"))
        };
        let mgr = SyncServerManager::new(options, launcher.clone());
        let proj = project(&tmp);

        let err = mgr.acquire(&proj).await.unwrap_err();
        assert!(matches!(err, RuntimeError::StartupTimeout { .. }));
        assert!(mgr.list().await.is_empty());
        let pid = launcher.pids()[0];
        assert!(eventually(Duration::from_secs(5), move || async move { !is_pid_alive(pid) }).await);
    }
}
