//! Runtime registry: starts, reuses and tears down language backends.
//!
//! The registry owns the session table. Starts for the same name are
//! serialized through an [`InFlight`] cache so concurrent callers share one
//! spawn. Session records handed out are snapshots; host/port migration
//! updates the table entry in place under the same name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{Mutex, MutexGuard};

use super::models::{DocumentContext, RuntimeMode, RuntimeSession, SessionState, StartConfig};
use super::probe::HealthProbe;
use super::store::{PersistedRuntime, StateStore};
use crate::error::{RuntimeError, RuntimeResult};
use crate::inflight::InFlight;
use crate::process::{
    ExitInfo, LaunchSpec, ProcessLauncher, Supervisor, allocate_port, is_pid_alive,
    is_port_available, terminate_pid, wait_for_port,
};
use crate::resolver::{LanguageSpec, ResolvedLocation, RuntimeResolver};

/// Registry settings that are not collaborators.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Host local backends bind to.
    pub host: String,
    pub default_language: String,
    /// SIGTERM to SIGKILL grace period.
    pub stop_grace: Duration,
    /// Where `runtimes.json` lives. Nothing is persisted if unset.
    pub state_dir: Option<PathBuf>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            default_language: "python".to_string(),
            stop_grace: Duration::from_secs(3),
            state_dir: None,
        }
    }
}

struct Entry {
    session: RuntimeSession,
    config: StartConfig,
    process: Option<Supervisor>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, Entry>,
    /// Last start configuration per name, kept after exit for `restart`.
    configs: HashMap<String, StartConfig>,
}

struct RegistryInner {
    resolver: RuntimeResolver,
    launcher: Arc<dyn ProcessLauncher>,
    probe: HealthProbe,
    store: Option<StateStore>,
    options: RegistryOptions,
    state: Mutex<RegistryState>,
    starts: InFlight<RuntimeSession>,
}

/// Table of runtime sessions. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RuntimeRegistry {
    inner: Arc<RegistryInner>,
}

impl RuntimeRegistry {
    pub fn new(
        resolver: RuntimeResolver,
        launcher: Arc<dyn ProcessLauncher>,
        probe: HealthProbe,
        options: RegistryOptions,
    ) -> Self {
        let store = options.state_dir.as_deref().map(StateStore::new);
        Self {
            inner: Arc::new(RegistryInner {
                resolver,
                launcher,
                probe,
                store,
                options,
                state: Mutex::new(RegistryState::default()),
                starts: InFlight::new(),
            }),
        }
    }

    pub fn resolver(&self) -> &RuntimeResolver {
        &self.inner.resolver
    }

    pub fn probe(&self) -> &HealthProbe {
        &self.inner.probe
    }

    pub fn default_language(&self) -> &str {
        &self.inner.options.default_language
    }

    async fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.state.lock().await
    }

    /// Start a runtime, or return the live session with the same name.
    pub async fn start(&self, config: StartConfig) -> RuntimeResult<RuntimeSession> {
        if let Some(session) = self.alive_session(&config.name).await {
            debug!("Reusing runtime {} on port {}", session.name, session.port);
            return Ok(session);
        }

        let name = config.name.clone();
        let this = self.clone();
        self.inner
            .starts
            .run(&name, move || async move { this.start_uncached(config).await })
            .await
    }

    /// Cache every start for a name goes through, whichever service
    /// dispatches it.
    pub(crate) fn starts(&self) -> &InFlight<RuntimeSession> {
        &self.inner.starts
    }

    /// Start without joining the in-flight cache. Callers hold the cache
    /// slot for `config.name`.
    pub(crate) async fn start_uncached(&self, mut config: StartConfig) -> RuntimeResult<RuntimeSession> {
        // A previous in-flight start may have settled between the reuse check and here.
        if let Some(session) = self.alive_session(&config.name).await {
            return Ok(session);
        }

        config.language = config.language.to_ascii_lowercase();
        self.lock()
            .await
            .configs
            .insert(config.name.clone(), config.clone());

        let location = self
            .inner
            .resolver
            .resolve(&config.language)
            .ok_or_else(|| RuntimeError::Resolution(config.language.clone()))?;

        match location {
            ResolvedLocation::Remote { url } => {
                let (host, port) = parse_host_port(&url)?;
                info!("Runtime {} is remote at {}", config.name, url);
                let session = RuntimeSession::alive(&config, RuntimeMode::Remote, host, port, None);
                Ok(self.register(session, config).await)
            }
            ResolvedLocation::Local {
                package_dir,
                entry_point,
            } => {
                let spec = self
                    .inner
                    .resolver
                    .spec(&config.language)
                    .cloned()
                    .ok_or_else(|| RuntimeError::Resolution(config.language.clone()))?;
                self.spawn_local(config, &spec, &package_dir, &entry_point)
                    .await
            }
        }
    }

    async fn spawn_local(
        &self,
        config: StartConfig,
        spec: &LanguageSpec,
        package_dir: &Path,
        entry_point: &Path,
    ) -> RuntimeResult<RuntimeSession> {
        let host = self.inner.options.host.clone();
        let port = allocate_port(&host)?;
        let launch = build_launch_spec(&config, spec, package_dir, entry_point, port);

        info!(
            "Starting {} runtime {} on port {} (cwd {})",
            config.language,
            config.name,
            port,
            config.cwd.display()
        );
        let child = self.inner.launcher.launch(&launch).await?;
        let supervisor = Supervisor::spawn(child, &config.name, self.inner.options.stop_grace)
            .ok_or_else(|| RuntimeError::Spawn {
                name: config.name.clone(),
                message: "process exited before it could be tracked".to_string(),
            })?;
        let pid = supervisor.pid();

        let mut session =
            RuntimeSession::alive(&config, RuntimeMode::Local, host.clone(), port, Some(pid));
        session.alive = false;
        session.state = SessionState::Starting;
        self.lock().await.sessions.insert(
            config.name.clone(),
            Entry {
                session,
                config: config.clone(),
                process: Some(supervisor.clone()),
            },
        );
        self.watch_exit(config.name.clone(), supervisor.clone());

        let timeout = Duration::from_secs(spec.startup_timeout_secs);
        let ready = tokio::select! {
            ready = wait_for_port(&host, port, timeout) => Ok(ready),
            exit = supervisor.wait() => Err(exit),
        };

        match ready {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    "Runtime {} not reachable on port {} after {:?}, killing PID {}",
                    config.name, port, timeout, pid
                );
                supervisor.stop().await;
                self.remove_if_pid(&config.name, pid).await;
                return Err(RuntimeError::StartupTimeout {
                    name: config.name,
                    port,
                    timeout_secs: spec.startup_timeout_secs,
                });
            }
            Err(exit) => {
                self.remove_if_pid(&config.name, pid).await;
                return Err(RuntimeError::UnexpectedExit {
                    name: config.name,
                    reason: exit.describe(),
                });
            }
        }

        let session = {
            let mut state = self.lock().await;
            match state.sessions.get_mut(&config.name) {
                Some(entry) if entry.session.pid == Some(pid) => {
                    entry.session.alive = true;
                    entry.session.state = SessionState::Alive;
                    entry.session.clone()
                }
                _ => {
                    return Err(RuntimeError::UnexpectedExit {
                        name: config.name,
                        reason: "stopped during startup".to_string(),
                    });
                }
            }
        };

        if let Some(store) = &self.inner.store {
            store.upsert(
                &session.name,
                PersistedRuntime {
                    pid,
                    port,
                    language: session.language.clone(),
                    cwd: session.cwd.clone(),
                },
            );
        }
        info!("Runtime {} ready on port {} (PID {})", session.name, port, pid);
        Ok(session)
    }

    fn watch_exit(&self, name: String, supervisor: Supervisor) {
        let this = self.clone();
        tokio::spawn(async move {
            let info = supervisor.wait().await;
            this.on_process_exit(&name, supervisor.pid(), info).await;
        });
    }

    async fn on_process_exit(&self, name: &str, pid: u32, info: ExitInfo) {
        let removed = self.remove_if_pid(name, pid).await;
        if info.expected {
            debug!("Runtime {} (PID {}) {}", name, pid, info.describe());
        } else {
            let err = RuntimeError::UnexpectedExit {
                name: name.to_string(),
                reason: info.describe(),
            };
            warn!(
                "{} (exit code {:?}, signal {:?}){}",
                err,
                info.code,
                info.signal,
                if removed { "; session removed" } else { "" }
            );
        }
    }

    /// Drop `name` if it still belongs to process `pid`.
    async fn remove_if_pid(&self, name: &str, pid: u32) -> bool {
        let removed = {
            let mut state = self.lock().await;
            match state.sessions.get(name) {
                Some(entry) if entry.session.pid == Some(pid) => state.sessions.remove(name).is_some(),
                _ => false,
            }
        };
        if removed && let Some(store) = &self.inner.store {
            store.remove(name);
        }
        removed
    }

    /// Add a session with no local process (remote, cloud or tunnel-routed).
    /// Replaces any existing entry with the same name.
    pub async fn register(&self, session: RuntimeSession, config: StartConfig) -> RuntimeSession {
        let mut state = self.lock().await;
        state.configs.insert(session.name.clone(), config.clone());
        state.sessions.insert(
            session.name.clone(),
            Entry {
                session: session.clone(),
                config,
                process: None,
            },
        );
        session
    }

    /// Stop a session. Unknown names are not an error.
    ///
    /// Returns whether a session was removed.
    pub async fn stop(&self, name: &str) -> bool {
        let process = {
            let mut state = self.lock().await;
            let Some(entry) = state.sessions.get_mut(name) else {
                debug!("Stop requested for unknown runtime {}", name);
                return false;
            };
            match entry.process.clone() {
                Some(process) => {
                    entry.session.alive = false;
                    entry.session.state = SessionState::Dying;
                    process
                }
                None => {
                    let mode = entry.session.mode;
                    state.sessions.remove(name);
                    info!("Removed {} runtime session {}", mode_label(mode), name);
                    return true;
                }
            }
        };

        info!("Stopping runtime {} (PID {})", name, process.pid());
        process.stop().await;
        self.remove_if_pid(name, process.pid()).await;
        true
    }

    /// Stop and start again with the last configuration used for `name`.
    pub async fn restart(&self, name: &str) -> RuntimeResult<RuntimeSession> {
        let config = self
            .start_config(name)
            .await
            .ok_or_else(|| RuntimeError::UnknownSession(name.to_string()))?;

        info!("Restarting runtime {}", name);
        self.stop(name).await;
        self.start(config).await
    }

    /// Snapshot of the session called `name`, in any state.
    pub async fn attach(&self, name: &str) -> Option<RuntimeSession> {
        self.lock()
            .await
            .sessions
            .get(name)
            .map(|entry| entry.session.clone())
    }

    /// Configuration `name` was last started with, if any.
    pub async fn start_config(&self, name: &str) -> Option<StartConfig> {
        let state = self.lock().await;
        state
            .sessions
            .get(name)
            .map(|entry| entry.config.clone())
            .or_else(|| state.configs.get(name).cloned())
    }

    pub(crate) async fn alive_session(&self, name: &str) -> Option<RuntimeSession> {
        let state = self.lock().await;
        let entry = state.sessions.get(name)?;
        let running = entry.process.as_ref().is_none_or(Supervisor::is_running);
        (entry.session.alive && running).then(|| entry.session.clone())
    }

    /// All sessions, sorted by name.
    pub async fn list(&self) -> Vec<RuntimeSession> {
        let mut sessions: Vec<RuntimeSession> = self
            .lock()
            .await
            .sessions
            .values()
            .map(|entry| entry.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.name.cmp(&b.name));
        sessions
    }

    /// On-demand liveness. Remote and cloud sessions are probed and removed
    /// if the probe fails; local sessions report whether the process runs.
    pub async fn check_liveness(&self, name: &str) -> bool {
        let (session, process) = {
            let state = self.lock().await;
            match state.sessions.get(name) {
                Some(entry) => (entry.session.clone(), entry.process.clone()),
                None => return false,
            }
        };

        if let Some(process) = process {
            return session.alive && process.is_running();
        }
        // The tunnel drops its ports on disconnect; callers check those.
        if session.via_tunnel {
            return session.alive;
        }

        match self.inner.probe.check(&session.url()).await {
            Ok(()) => true,
            Err(e) => {
                warn!("{} runtime {} failed liveness probe: {}", mode_label(session.mode), name, e);
                let mut state = self.lock().await;
                // Only drop the record we probed; it may have migrated meanwhile.
                if state
                    .sessions
                    .get(name)
                    .is_some_and(|entry| entry.session.host == session.host && entry.session.port == session.port)
                {
                    state.sessions.remove(name);
                }
                false
            }
        }
    }

    /// Point every process-less session of `mode` and `language` at a new
    /// location. Names and start times are kept.
    pub async fn relocate(
        &self,
        mode: RuntimeMode,
        language: &str,
        host: &str,
        port: u16,
    ) -> Vec<RuntimeSession> {
        let mut state = self.lock().await;
        let mut moved = Vec::new();
        for entry in state.sessions.values_mut() {
            if entry.process.is_none()
                && entry.session.mode == mode
                && entry.session.language.eq_ignore_ascii_case(language)
            {
                info!(
                    "Migrating runtime {} from {}:{} to {}:{}",
                    entry.session.name, entry.session.host, entry.session.port, host, port
                );
                entry.session.host = host.to_string();
                entry.session.port = port;
                moved.push(entry.session.clone());
            }
        }
        moved
    }

    /// Runtime for a document's primary language.
    pub async fn get_for_document(&self, ctx: &DocumentContext) -> RuntimeSession {
        let language = ctx
            .languages(self.default_language())
            .into_iter()
            .next()
            .unwrap_or_else(|| self.default_language().to_string());
        self.get_for_document_language(ctx, &language).await
    }

    /// Runtime for `language` scoped to the document's project. Failures are
    /// returned as a dead session carrying the error.
    pub async fn get_for_document_language(
        &self,
        ctx: &DocumentContext,
        language: &str,
    ) -> RuntimeSession {
        let name = ctx.session_name(language);
        if let Some(session) = self.alive_session(&name).await {
            return session;
        }

        let config = StartConfig {
            name: name.clone(),
            language: language.to_ascii_lowercase(),
            cwd: ctx.infer_cwd(),
            venv: ctx.infer_venv(language),
            project_root: Some(ctx.project_root.clone()),
        };
        let cwd = config.cwd.clone();
        match self.start(config).await {
            Ok(session) => session,
            Err(e) => {
                warn!("No {} runtime for {}: {}", language, ctx.path.display(), e);
                RuntimeSession::failed(name, language, cwd, e.to_string())
            }
        }
    }

    /// Stop every session.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.lock().await.sessions.keys().cloned().collect();
        for name in names {
            self.stop(&name).await;
        }
    }

    /// Terminate backends recorded by a previous run that are still holding
    /// their port, then forget them.
    pub fn reap_orphans(&self) -> usize {
        let Some(store) = &self.inner.store else {
            return 0;
        };
        let mut reaped = 0;
        for (name, record) in store.load() {
            if is_pid_alive(record.pid) && !is_port_available(record.port) {
                info!(
                    "Terminating orphaned runtime {} (PID {}, port {})",
                    name, record.pid, record.port
                );
                if terminate_pid(record.pid) {
                    reaped += 1;
                }
            }
        }
        store.clear();
        reaped
    }
}

fn mode_label(mode: RuntimeMode) -> &'static str {
    match mode {
        RuntimeMode::Local => "local",
        RuntimeMode::Remote => "remote",
        RuntimeMode::Cloud => "cloud",
    }
}

fn parse_host_port(url: &str) -> RuntimeResult<(String, u16)> {
    let parsed = reqwest::Url::parse(url).map_err(|e| RuntimeError::UnreachableRemote {
        url: url.to_string(),
        message: e.to_string(),
    })?;
    let host = parsed.host_str().ok_or_else(|| RuntimeError::UnreachableRemote {
        url: url.to_string(),
        message: "URL has no host".to_string(),
    })?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| RuntimeError::UnreachableRemote {
            url: url.to_string(),
            message: "URL has no port".to_string(),
        })?;
    Ok((host.to_string(), port))
}

/// Command line and environment for a local backend.
fn build_launch_spec(
    config: &StartConfig,
    spec: &LanguageSpec,
    package_dir: &Path,
    entry_point: &Path,
    port: u16,
) -> LaunchSpec {
    let entry = entry_point.to_string_lossy().into_owned();
    let venv_python = config
        .venv
        .as_ref()
        .filter(|_| config.language == "python")
        .map(|venv| venv.join("bin").join("python"));

    let (program, mut args) = match (&venv_python, &spec.interpreter) {
        (Some(python), _) => (python.to_string_lossy().into_owned(), vec![entry]),
        (None, Some(interpreter)) => (interpreter.clone(), vec![entry]),
        (None, None) => (entry, Vec::new()),
    };
    args.push("--port".to_string());
    args.push(port.to_string());
    if spec.accepts_cwd {
        args.push("--cwd".to_string());
        args.push(config.cwd.to_string_lossy().into_owned());
    }
    args.extend(spec.args.iter().cloned());

    let mut env = HashMap::new();
    env.insert("NBGATE_RUNTIME_NAME".to_string(), config.name.clone());
    env.insert("NBGATE_RUNTIME_PORT".to_string(), port.to_string());
    env.insert(
        "NBGATE_RUNTIME_PACKAGE".to_string(),
        package_dir.to_string_lossy().into_owned(),
    );
    if let Some(venv) = &config.venv
        && venv_python.is_some()
    {
        let bin = venv.join("bin");
        let path = match std::env::var("PATH") {
            Ok(existing) if !existing.is_empty() => format!("{}:{}", bin.display(), existing),
            _ => bin.display().to_string(),
        };
        env.insert("VIRTUAL_ENV".to_string(), venv.to_string_lossy().into_owned());
        env.insert("PATH".to_string(), path);
    }

    let cwd = if config.cwd.is_dir() {
        config.cwd.clone()
    } else {
        package_dir.to_path_buf()
    };

    LaunchSpec {
        name: config.name.clone(),
        program,
        args,
        cwd: Some(cwd),
        env,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{force_kill_pid, is_pid_alive};
    use crate::resolver::default_languages;
    use crate::testing::{FakeLauncher, eventually};
    use std::collections::HashMap as Map;

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        state_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let python = root.join("bundle").join("python");
        std::fs::create_dir_all(&python).unwrap();
        std::fs::write(python.join("pyproject.toml"), "").unwrap();
        Fixture {
            state_dir: root.join("state"),
            root,
            _tmp: tmp,
        }
    }

    fn registry(
        fx: &Fixture,
        launcher: Arc<FakeLauncher>,
        env: &[(&str, &str)],
        startup_timeout_secs: u64,
    ) -> RuntimeRegistry {
        let mut languages = default_languages();
        if let Some(python) = languages.get_mut("python") {
            python.startup_timeout_secs = startup_timeout_secs;
        }
        let env: Map<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let resolver = RuntimeResolver::new(languages)
            .with_env(move |key| env.get(key).cloned())
            .with_bundled_dir(fx.root.join("bundle"));

        RuntimeRegistry::new(
            resolver,
            launcher,
            HealthProbe::new("/api/capabilities", Duration::from_millis(500)),
            RegistryOptions {
                state_dir: Some(fx.state_dir.clone()),
                stop_grace: Duration::from_secs(1),
                ..RegistryOptions::default()
            },
        )
    }

    fn config(fx: &Fixture, name: &str) -> StartConfig {
        StartConfig {
            name: name.to_string(),
            language: "python".to_string(),
            cwd: fx.root.clone(),
            venv: None,
            project_root: None,
        }
    }

    #[tokio::test]
    async fn test_concurrent_starts_spawn_once() {
        let fx = fixture();
        let launcher = FakeLauncher::binding();
        let reg = registry(&fx, launcher.clone(), &[], 5);

        let mut handles = Vec::new();
        for _ in 0..6 {
            let reg = reg.clone();
            let config = config(&fx, "py-a");
            handles.push(tokio::spawn(async move { reg.start(config).await }));
        }
        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(launcher.launches(), 1);
        let first = &sessions[0];
        assert!(first.pid.is_some());
        for session in &sessions {
            assert_eq!(session.port, first.port);
            assert_eq!(session.pid, first.pid);
            assert_eq!(session.state, SessionState::Alive);
        }

        // A later call reuses without touching the launcher.
        let again = reg.start(config(&fx, "py-a")).await.unwrap();
        assert_eq!(again.pid, first.pid);
        assert_eq!(launcher.launches(), 1);

        reg.stop_all().await;
    }

    #[tokio::test]
    async fn test_launch_spec_carries_port_and_cwd() {
        let fx = fixture();
        let launcher = FakeLauncher::binding();
        let reg = registry(&fx, launcher.clone(), &[], 5);

        let session = reg.start(config(&fx, "py-b")).await.unwrap();
        let spec = launcher.last_spec().unwrap();
        assert_eq!(spec.program, "python3");
        assert!(spec.args[0].ends_with("nbgate_runtime/server.py"));
        assert_eq!(crate::testing::port_arg(&spec.args), Some(session.port));
        assert!(spec.args.contains(&"--cwd".to_string()));
        assert_eq!(spec.env["NBGATE_RUNTIME_NAME"], "py-b");

        reg.stop("py-b").await;
    }

    #[tokio::test]
    async fn test_startup_timeout_kills_process() {
        let fx = fixture();
        let launcher = FakeLauncher::silent();
        let reg = registry(&fx, launcher.clone(), &[], 1);

        let err = reg.start(config(&fx, "py-slow")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::StartupTimeout { timeout_secs: 1, .. }));

        let pid = launcher.pids()[0];
        assert!(eventually(Duration::from_secs(3), move || async move { !is_pid_alive(pid) }).await);
        assert!(reg.attach("py-slow").await.is_none());
        assert!(StateStore::new(&fx.state_dir).load().is_empty());
    }

    #[tokio::test]
    async fn test_remote_override_registers_virtual_session() {
        let fx = fixture();
        let launcher = FakeLauncher::binding();
        let reg = registry(
            &fx,
            launcher.clone(),
            &[("NBGATE_PYTHON_RUNTIME_URL", "http://10.0.0.5:9001")],
            5,
        );

        let session = reg.start(config(&fx, "py-remote")).await.unwrap();
        assert_eq!(session.mode, RuntimeMode::Remote);
        assert_eq!(session.pid, None);
        assert_eq!(session.host, "10.0.0.5");
        assert_eq!(session.port, 9001);
        assert_eq!(launcher.launches(), 0);

        assert!(reg.stop("py-remote").await);
        assert!(reg.attach("py-remote").await.is_none());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let fx = fixture();
        let reg = registry(&fx, FakeLauncher::binding(), &[], 5);
        assert!(!reg.stop("never-started").await);

        reg.start(config(&fx, "py-c")).await.unwrap();
        assert!(reg.stop("py-c").await);
        assert!(!reg.stop("py-c").await);
        assert!(reg.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_exit_removes_session() {
        let fx = fixture();
        let reg = registry(&fx, FakeLauncher::binding(), &[], 5);

        let session = reg.start(config(&fx, "py-d")).await.unwrap();
        let pid = session.pid.unwrap();
        assert!(StateStore::new(&fx.state_dir).load().contains_key("py-d"));

        assert!(force_kill_pid(pid));
        let gone = eventually(Duration::from_secs(3), || {
            let reg = reg.clone();
            async move { reg.attach("py-d").await.is_none() }
        })
        .await;
        assert!(gone);
        assert!(!StateStore::new(&fx.state_dir).load().contains_key("py-d"));
    }

    #[tokio::test]
    async fn test_restart_uses_previous_config() {
        let fx = fixture();
        let launcher = FakeLauncher::binding();
        let reg = registry(&fx, launcher.clone(), &[], 5);

        let first = reg.start(config(&fx, "py-e")).await.unwrap();
        let second = reg.restart("py-e").await.unwrap();
        assert_ne!(first.pid, second.pid);
        assert_eq!(second.name, "py-e");
        assert_eq!(launcher.launches(), 2);

        assert_eq!(
            reg.restart("unknown").await,
            Err(RuntimeError::UnknownSession("unknown".to_string()))
        );
        reg.stop_all().await;
    }

    #[tokio::test]
    async fn test_get_for_document_degrades_to_dead_session() {
        let fx = fixture();
        let reg = registry(&fx, FakeLauncher::binding(), &[], 5);
        let mut ctx = DocumentContext {
            path: fx.root.join("doc.qmd"),
            project_root: fx.root.clone(),
            ..DocumentContext::default()
        };
        ctx.frontmatter.runtime = Some("cobol".to_string());

        let session = reg.get_for_document(&ctx).await;
        assert!(!session.alive);
        assert_eq!(session.language, "cobol");
        assert!(session.last_error.unwrap().contains("cobol"));
    }

    #[tokio::test]
    async fn test_get_for_document_reuses_project_session() {
        let fx = fixture();
        let launcher = FakeLauncher::binding();
        let reg = registry(&fx, launcher.clone(), &[], 5);
        let a = DocumentContext {
            path: fx.root.join("a.qmd"),
            project_root: fx.root.clone(),
            ..DocumentContext::default()
        };
        let b = DocumentContext {
            path: fx.root.join("sub").join("b.qmd"),
            ..a.clone()
        };

        let first = reg.get_for_document(&a).await;
        let second = reg.get_for_document(&b).await;
        assert!(first.alive);
        assert_eq!(first.name, second.name);
        assert_eq!(first.pid, second.pid);
        assert_eq!(launcher.launches(), 1);

        reg.stop_all().await;
    }

    #[tokio::test]
    async fn test_failed_probe_removes_remote_session() {
        let fx = fixture();
        let dead_port = allocate_port("127.0.0.1").unwrap();
        let url = format!("http://127.0.0.1:{dead_port}");
        let reg = registry(
            &fx,
            FakeLauncher::binding(),
            &[("NBGATE_PYTHON_RUNTIME_URL", url.as_str())],
            5,
        );

        reg.start(config(&fx, "py-f")).await.unwrap();
        assert!(!reg.check_liveness("py-f").await);
        assert!(reg.attach("py-f").await.is_none());
        assert!(!reg.check_liveness("py-f").await);
    }

    #[tokio::test]
    async fn test_relocate_keeps_identity() {
        let fx = fixture();
        let reg = registry(&fx, FakeLauncher::binding(), &[], 5);
        let cfg = config(&fx, "cloud-python");
        let session = RuntimeSession::alive(&cfg, RuntimeMode::Cloud, "10.0.0.1", 8765, None);
        reg.register(session.clone(), cfg).await;

        let moved = reg.relocate(RuntimeMode::Cloud, "python", "10.0.0.2", 9000).await;
        assert_eq!(moved.len(), 1);

        let current = reg.attach("cloud-python").await.unwrap();
        assert_eq!(current.name, session.name);
        assert_eq!(current.started_at, session.started_at);
        assert_eq!((current.host.as_str(), current.port), ("10.0.0.2", 9000));
    }

    #[test]
    fn test_build_launch_spec_with_venv() {
        let config = StartConfig {
            name: "py".to_string(),
            language: "python".to_string(),
            cwd: PathBuf::from("/nonexistent/project"),
            venv: Some(PathBuf::from("/envs/main")),
            project_root: None,
        };
        let spec = default_languages()["python"].clone();
        let launch = build_launch_spec(
            &config,
            &spec,
            Path::new("/pkg"),
            Path::new("/pkg/nbgate_runtime/server.py"),
            7000,
        );

        assert_eq!(launch.program, "/envs/main/bin/python");
        assert_eq!(
            launch.args,
            vec![
                "/pkg/nbgate_runtime/server.py",
                "--port",
                "7000",
                "--cwd",
                "/nonexistent/project"
            ]
        );
        assert_eq!(launch.env["VIRTUAL_ENV"], "/envs/main");
        assert!(launch.env["PATH"].starts_with("/envs/main/bin"));
        assert_eq!(launch.cwd, Some(PathBuf::from("/pkg")));
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_host_port("http://10.0.0.5:9001").unwrap(),
            ("10.0.0.5".to_string(), 9001)
        );
        assert_eq!(
            parse_host_port("https://runtime.example.com").unwrap(),
            ("runtime.example.com".to_string(), 443)
        );
        assert!(parse_host_port("not a url").is_err());
    }
}
