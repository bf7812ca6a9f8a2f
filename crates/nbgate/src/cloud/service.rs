//! Language dispatch across the relay tunnel, the cloud runtime and the
//! local registry.
//!
//! Routed languages go to a pre-provisioned runtime at the configured
//! host:port after a capability probe. Everything else is started by the
//! [`RuntimeRegistry`]. When the relay tunnel has a provider online, starts
//! are sent to the provider instead.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;

use crate::config::CloudConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::{DocumentContext, RuntimeMode, RuntimeRegistry, RuntimeSession, StartConfig};
use crate::tunnel::TunnelClient;

#[derive(Debug, Clone)]
pub struct CloudOptions {
    pub routed_languages: Vec<String>,
    pub host: String,
    pub port: u16,
    pub probe_timeout: Duration,
}

impl CloudOptions {
    pub fn from_config(config: &CloudConfig) -> Self {
        Self {
            routed_languages: config
                .routed_languages
                .iter()
                .map(|l| l.to_ascii_lowercase())
                .collect(),
            host: config.host.clone(),
            port: config.port,
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
        }
    }
}

/// Current address of the cloud runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloudLocation {
    pub host: String,
    pub port: u16,
}

impl CloudLocation {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

struct CloudInner {
    registry: RuntimeRegistry,
    tunnel: Option<TunnelClient>,
    routed: Vec<String>,
    probe_timeout: Duration,
    location: RwLock<CloudLocation>,
}

#[derive(Clone)]
pub struct CloudSessionService {
    inner: Arc<CloudInner>,
}

impl CloudSessionService {
    pub fn new(registry: RuntimeRegistry, tunnel: Option<TunnelClient>, options: CloudOptions) -> Self {
        Self {
            inner: Arc::new(CloudInner {
                registry,
                tunnel,
                routed: options.routed_languages,
                probe_timeout: options.probe_timeout,
                location: RwLock::new(CloudLocation {
                    host: options.host,
                    port: options.port,
                }),
            }),
        }
    }

    pub fn registry(&self) -> &RuntimeRegistry {
        &self.inner.registry
    }

    pub fn tunnel(&self) -> Option<&TunnelClient> {
        self.inner.tunnel.as_ref()
    }

    pub fn is_routed(&self, language: &str) -> bool {
        self.inner
            .routed
            .iter()
            .any(|l| l.eq_ignore_ascii_case(language))
    }

    pub fn location(&self) -> CloudLocation {
        self.inner
            .location
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn tunnel_available(&self) -> bool {
        self.inner.tunnel.as_ref().is_some_and(TunnelClient::is_available)
    }

    /// Whether the tunnel still routes `session`'s port.
    fn tunnel_routes(&self, session: &RuntimeSession) -> bool {
        self.inner
            .tunnel
            .as_ref()
            .is_some_and(|t| t.is_available() && t.is_tunnel_port(session.port))
    }

    /// Remove tunnel sessions whose route is gone. Returns how many were
    /// removed.
    pub async fn prune_tunnel_sessions(&self) -> usize {
        let stale: Vec<String> = self
            .inner
            .registry
            .list()
            .await
            .into_iter()
            .filter(|s| s.via_tunnel && !self.tunnel_routes(s))
            .map(|s| s.name)
            .collect();
        for name in &stale {
            info!("Dropping tunnel runtime {}: tunnel no longer routes it", name);
            self.inner.registry.stop(name).await;
        }
        stale.len()
    }

    async fn drop_stale_tunnel_session(&self, name: &str) {
        if let Some(session) = self.inner.registry.attach(name).await
            && session.via_tunnel
            && !self.tunnel_routes(&session)
        {
            info!("Dropping tunnel runtime {}: tunnel no longer routes it", name);
            self.inner.registry.stop(name).await;
        }
    }

    /// Sessions in every mode, without tunnel sessions that lost their route.
    pub async fn list(&self) -> Vec<RuntimeSession> {
        self.prune_tunnel_sessions().await;
        self.inner.registry.list().await
    }

    /// Snapshot of `name`, unless it is a tunnel session that lost its route.
    pub async fn attach(&self, name: &str) -> Option<RuntimeSession> {
        self.drop_stale_tunnel_session(name).await;
        self.inner.registry.attach(name).await
    }

    /// Start a runtime wherever its language is served.
    ///
    /// Starts share the registry's in-flight cache, so concurrent calls for
    /// one name collapse whichever way they are dispatched.
    pub async fn start(&self, config: StartConfig) -> RuntimeResult<RuntimeSession> {
        self.drop_stale_tunnel_session(&config.name).await;
        if let Some(session) = self.inner.registry.alive_session(&config.name).await {
            debug!("Reusing runtime {} on port {}", session.name, session.port);
            return Ok(session);
        }

        let name = config.name.clone();
        let this = self.clone();
        self.inner
            .registry
            .starts()
            .run(&name, move || async move { this.dispatch(config).await })
            .await
    }

    async fn dispatch(&self, config: StartConfig) -> RuntimeResult<RuntimeSession> {
        if self.tunnel_available() {
            if let Some(session) = self.inner.registry.alive_session(&config.name).await {
                return Ok(session);
            }
            self.start_via_tunnel(config).await
        } else if self.is_routed(&config.language) {
            if let Some(session) = self.inner.registry.alive_session(&config.name).await {
                return Ok(session);
            }
            self.start_routed(config).await
        } else {
            self.inner.registry.start_uncached(config).await
        }
    }

    async fn start_via_tunnel(&self, config: StartConfig) -> RuntimeResult<RuntimeSession> {
        let tunnel = self
            .inner
            .tunnel
            .as_ref()
            .ok_or(RuntimeError::TunnelDisconnected)?;
        let project_root = config.project_root().to_string_lossy().into_owned();
        let grant = tunnel
            .start_runtime(
                &config.language,
                &project_root,
                Some(config.cwd.to_string_lossy().into_owned()),
                config.venv.as_ref().map(|v| v.to_string_lossy().into_owned()),
            )
            .await?;

        info!(
            "Provider started {} runtime {} on tunnel port {}",
            config.language, config.name, grant.port
        );
        let mut session = RuntimeSession::alive(&config, RuntimeMode::Remote, "tunnel", grant.port, grant.pid);
        session.via_tunnel = true;
        Ok(self.inner.registry.register(session, config).await)
    }

    async fn start_routed(&self, config: StartConfig) -> RuntimeResult<RuntimeSession> {
        let location = self.location();
        let url = location.url();
        let probe = self.inner.registry.probe();
        match tokio::time::timeout(self.inner.probe_timeout, probe.check(&url)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Cloud {} runtime unreachable: {}", config.language, e);
                return Err(e);
            }
            Err(_) => {
                return Err(RuntimeError::UnreachableRemote {
                    url,
                    message: format!("no answer within {}ms", self.inner.probe_timeout.as_millis()),
                });
            }
        }

        info!("Registering cloud {} runtime {} at {}", config.language, config.name, url);
        let session = RuntimeSession::alive(&config, RuntimeMode::Cloud, location.host, location.port, None);
        Ok(self.inner.registry.register(session, config).await)
    }

    /// Stop a session in any mode. Unknown names are not an error.
    pub async fn stop(&self, name: &str) -> bool {
        self.inner.registry.stop(name).await
    }

    /// Stop `name` and start it again from its last configuration, through
    /// the same dispatch as [`start`](Self::start).
    pub async fn restart(&self, name: &str) -> RuntimeResult<RuntimeSession> {
        let config = self
            .inner
            .registry
            .start_config(name)
            .await
            .ok_or_else(|| RuntimeError::UnknownSession(name.to_string()))?;
        info!("Restarting runtime {}", name);
        self.inner.registry.stop(name).await;
        self.start(config).await
    }

    /// Liveness for any session. Tunnel sessions are alive while the tunnel
    /// still routes their port.
    pub async fn check_liveness(&self, name: &str) -> bool {
        if let Some(session) = self.inner.registry.attach(name).await
            && session.via_tunnel
        {
            let routed = self.tunnel_routes(&session);
            if !routed {
                debug!("Tunnel runtime {} lost its route", name);
                self.inner.registry.stop(name).await;
            }
            return routed;
        }
        self.inner.registry.check_liveness(name).await
    }

    /// Move the cloud runtime. Existing routed sessions keep their names and
    /// now point at the new address.
    pub async fn update_runtime_port(&self, port: u16, host: Option<String>) -> Vec<RuntimeSession> {
        let location = {
            let mut location = self
                .inner
                .location
                .write()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(host) = host.filter(|h| !h.is_empty()) {
                location.host = host;
            }
            location.port = port;
            location.clone()
        };
        info!("Cloud runtime moved to {}", location.url());

        let mut moved = Vec::new();
        for language in &self.inner.routed {
            moved.extend(
                self.inner
                    .registry
                    .relocate(RuntimeMode::Cloud, language, &location.host, location.port)
                    .await,
            );
        }
        moved
    }

    /// One session per language the document asks for, keyed by language.
    /// Languages that could not be provided map to a dead descriptor.
    pub async fn get_for_document(&self, ctx: &DocumentContext) -> BTreeMap<String, RuntimeSession> {
        let languages = ctx.languages(self.inner.registry.default_language());
        let lookups = languages.into_iter().map(|language| async move {
            let session = self.session_for(ctx, &language).await;
            (language, session)
        });
        futures::future::join_all(lookups).await.into_iter().collect()
    }

    async fn session_for(&self, ctx: &DocumentContext, language: &str) -> RuntimeSession {
        let config = StartConfig {
            name: ctx.session_name(language),
            language: language.to_ascii_lowercase(),
            cwd: ctx.infer_cwd(),
            venv: ctx.infer_venv(language),
            project_root: Some(ctx.project_root.clone()),
        };
        let (name, cwd) = (config.name.clone(), config.cwd.clone());
        match self.start(config).await {
            Ok(session) => session,
            Err(e) => {
                warn!("No {} runtime for {}: {}", language, ctx.path.display(), e);
                RuntimeSession::failed(name, language, cwd, e.to_string())
            }
        }
    }
}
