//! Consumer side of the relay tunnel.
//!
//! One persistent WebSocket to the relay carries RPC, streamed HTTP and
//! tunneled socket traffic. Every request gets a fresh correlation id; the
//! matching pending entry is removed exactly once, by its reply, its
//! timeout, or a disconnect.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures::{SinkExt, Stream, StreamExt};
use log::{debug, info, warn};
use nbgate_protocol::{TunnelFrame, decode_payload, encode_payload};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::path_map::PathMap;
use crate::config::TunnelConfig;
use crate::error::{RuntimeError, RuntimeResult};

/// Close code sent to local sockets when the relay link drops.
pub const CLOSE_TUNNEL_LOST: u16 = 1011;

#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub url: String,
    pub user: String,
    pub token: Option<String>,
    pub rpc_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl TunnelOptions {
    pub fn from_config(config: &TunnelConfig) -> Self {
        Self {
            url: config.url.clone(),
            user: config.user.clone(),
            token: config.token.clone(),
            rpc_timeout: Duration::from_secs(config.rpc_timeout_secs),
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
        }
    }
}

/// Successful `start-runtime` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeGrant {
    pub port: u16,
    pub ports: Vec<u16>,
    pub cwd: Option<String>,
    pub pid: Option<u32>,
}

/// Head of a tunneled HTTP response; the body follows as a stream.
/// Dropping it before the body ends forgets the request.
#[derive(Debug)]
pub struct TunnelHttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    body: TunnelHttpBody,
}

impl TunnelHttpResponse {
    /// Body chunks in arrival order. Ends after `http-end`; yields an error
    /// and ends if the provider aborts mid-body.
    pub fn into_body(self) -> impl Stream<Item = RuntimeResult<Bytes>> + Send + 'static {
        self.body
    }
}

#[derive(Debug)]
struct TunnelHttpBody {
    id: u64,
    client: TunnelClient,
    chunks: UnboundedReceiverStream<RuntimeResult<Bytes>>,
}

impl Stream for TunnelHttpBody {
    type Item = RuntimeResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.chunks).poll_next(cx)
    }
}

impl Drop for TunnelHttpBody {
    fn drop(&mut self) {
        if self.client.lock().http.remove(&self.id).is_some() {
            debug!("Tunnel http request {} dropped before its body ended", self.id);
        }
    }
}

/// Relay-originated events for a tunneled socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Message { data: Vec<u8>, binary: bool },
    Closed { code: Option<u16>, reason: Option<String> },
    Error(String),
}

/// Filesystem context sent with `ws-open`, rewritten through the path map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketTarget {
    pub cwd: Option<String>,
    pub file: Option<String>,
    pub session: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProviderInfo {
    pub hostname: Option<String>,
    pub version: Option<String>,
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatus {
    pub enabled: bool,
    pub connected: bool,
    pub provider_online: bool,
    pub provider: Option<ProviderInfo>,
    pub pending: usize,
    pub tunnel_ports: Vec<u16>,
    pub path_mappings: BTreeMap<String, String>,
}

struct PendingRpc {
    reply: oneshot::Sender<RuntimeResult<RuntimeGrant>>,
    project_root: String,
}

struct PendingHttp {
    /// `None` once headers have been delivered.
    head: Option<oneshot::Sender<RuntimeResult<(u16, BTreeMap<String, String>)>>>,
    body: mpsc::UnboundedSender<RuntimeResult<Bytes>>,
}

struct PendingSocket {
    /// `None` once `ws-opened` has arrived.
    opened: Option<oneshot::Sender<RuntimeResult<()>>>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

#[derive(Default)]
struct TunnelState {
    connected: bool,
    provider_online: bool,
    provider: Option<ProviderInfo>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    rpcs: HashMap<u64, PendingRpc>,
    http: HashMap<u64, PendingHttp>,
    sockets: HashMap<u64, PendingSocket>,
    tunnel_ports: HashSet<u16>,
    paths: PathMap,
}

impl TunnelState {
    /// Fail every pending operation and forget routing knowledge.
    fn reject_all(&mut self, reason: &str) {
        let (rpcs, http, sockets) = (self.rpcs.len(), self.http.len(), self.sockets.len());
        if rpcs + http + sockets > 0 {
            info!(
                "Tunnel {}: rejecting {} rpc, {} http, closing {} socket(s)",
                reason, rpcs, http, sockets
            );
        }

        for (_, rpc) in self.rpcs.drain() {
            let _ = rpc.reply.send(Err(RuntimeError::TunnelDisconnected));
        }
        for (_, pending) in self.http.drain() {
            match pending.head {
                Some(head) => {
                    let _ = head.send(Err(RuntimeError::TunnelDisconnected));
                }
                None => {
                    let _ = pending.body.send(Err(RuntimeError::TunnelDisconnected));
                }
            }
        }
        for (_, socket) in self.sockets.drain() {
            match socket.opened {
                Some(opened) => {
                    let _ = opened.send(Err(RuntimeError::TunnelDisconnected));
                }
                None => {
                    let _ = socket.events.send(SocketEvent::Closed {
                        code: Some(CLOSE_TUNNEL_LOST),
                        reason: Some(reason.to_string()),
                    });
                }
            }
        }
        self.tunnel_ports.clear();
        self.paths.clear();
    }
}

struct TunnelInner {
    options: TunnelOptions,
    next_id: AtomicU64,
    state: Mutex<TunnelState>,
    shutdown: CancellationToken,
}

/// Handle to the relay tunnel. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct TunnelClient {
    inner: Arc<TunnelInner>,
}

impl std::fmt::Debug for TunnelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelClient")
            .field("url", &self.inner.options.url)
            .field("available", &self.is_available())
            .finish()
    }
}

impl TunnelClient {
    pub fn new(options: TunnelOptions) -> Self {
        Self {
            inner: Arc::new(TunnelInner {
                options,
                next_id: AtomicU64::new(1),
                state: Mutex::new(TunnelState::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TunnelState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Start the connect/reconnect loop.
    pub fn spawn(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    /// Stop the connection loop and fail everything pending.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    async fn run(self) {
        let delay = self.inner.options.reconnect_delay;
        loop {
            if self.inner.shutdown.is_cancelled() {
                break;
            }
            match self.connect_once().await {
                Ok(()) => info!("Tunnel connection to {} closed", self.inner.options.url),
                Err(e) => warn!("Tunnel connection to {} failed: {:#}", self.inner.options.url, e),
            }
            self.handle_disconnect("disconnected");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.inner.shutdown.cancelled() => break,
            }
            debug!("Reconnecting tunnel after {:?}", delay);
        }
        self.handle_disconnect("shut down");
    }

    fn connect_url(&self) -> String {
        let options = &self.inner.options;
        let sep = if options.url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}role=consumer&room={}",
            options.url,
            sep,
            urlencoding::encode(&options.user)
        );
        if let Some(token) = &options.token {
            url.push_str("&token=");
            url.push_str(&urlencoding::encode(token));
        }
        url
    }

    async fn connect_once(&self) -> anyhow::Result<()> {
        let url = self.connect_url();
        let (ws, _response) = tokio::select! {
            res = tokio_tungstenite::connect_async(url.as_str()) => res.context("connecting to relay")?,
            _ = self.inner.shutdown.cancelled() => return Ok(()),
        };
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        {
            let mut state = self.lock();
            state.connected = true;
            state.outbound = Some(tx);
        }
        info!("Tunnel connected to {} as consumer", self.inner.options.url);

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    warn!("Tunnel write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let result = loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    None => break Ok(()),
                    Some(Err(e)) => break Err(anyhow::Error::new(e).context("reading from relay")),
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Relay closed tunnel: {:?}", frame);
                        break Ok(());
                    }
                    Some(Ok(_)) => {}
                },
                _ = self.inner.shutdown.cancelled() => break Ok(()),
            }
        };

        // Dropping the outbound sender ends the writer.
        self.lock().outbound = None;
        writer.abort();
        result
    }

    fn handle_disconnect(&self, reason: &str) {
        let mut state = self.lock();
        let was_connected = state.connected;
        state.connected = false;
        state.provider_online = false;
        state.provider = None;
        state.outbound = None;
        state.reject_all(reason);
        if was_connected {
            warn!("Tunnel {}", reason);
        }
    }

    fn handle_text(&self, text: &str) {
        match TunnelFrame::parse(text) {
            Ok(frame) => self.dispatch(frame),
            Err(e) => {
                let err = RuntimeError::Protocol(e.to_string());
                warn!("Dropping tunnel frame: {}", err);
            }
        }
    }

    fn dispatch(&self, frame: TunnelFrame) {
        let mut state = self.lock();
        match frame {
            TunnelFrame::ProviderStatus { online } => {
                info!("Tunnel provider {}", if online { "online" } else { "offline" });
                state.provider_online = online;
                if !online {
                    state.provider = None;
                    state.reject_all("provider offline");
                }
            }
            TunnelFrame::ProviderGone => {
                info!("Tunnel provider gone");
                state.provider_online = false;
                state.provider = None;
                state.reject_all("provider gone");
            }
            TunnelFrame::ProviderInfo {
                hostname,
                version,
                languages,
            } => {
                debug!("Tunnel provider {:?} {:?} serves {:?}", hostname, version, languages);
                state.provider_online = true;
                state.provider = Some(ProviderInfo {
                    hostname,
                    version,
                    languages,
                });
            }

            TunnelFrame::RuntimeStarted {
                id,
                port,
                ports,
                cwd,
                pid,
            } => {
                let Some(rpc) = state.rpcs.remove(&id) else {
                    debug!("Late runtime-started for request {}", id);
                    return;
                };
                state.tunnel_ports.insert(port);
                state.tunnel_ports.extend(ports.iter().copied());
                if let Some(cwd) = &cwd
                    && state.paths.learn(&rpc.project_root, cwd)
                {
                    info!("Tunnel path mapping learned: {} -> {}", rpc.project_root, cwd);
                }
                let _ = rpc.reply.send(Ok(RuntimeGrant {
                    port,
                    ports,
                    cwd,
                    pid,
                }));
            }
            TunnelFrame::RuntimeError { id, error } => {
                if let Some(rpc) = state.rpcs.remove(&id) {
                    let _ = rpc.reply.send(Err(RuntimeError::Remote(error)));
                }
            }

            TunnelFrame::HttpRes {
                id,
                status,
                headers,
            } => match state.http.get_mut(&id).and_then(|p| p.head.take()) {
                Some(head) => {
                    let _ = head.send(Ok((status, headers)));
                }
                None => debug!("Unexpected http-res for request {}", id),
            },
            TunnelFrame::HttpChunk { id, data } => {
                let Some(pending) = state.http.get(&id) else {
                    return;
                };
                if pending.head.is_some() {
                    warn!("Dropping tunnel frame: http-chunk before http-res for request {}", id);
                    return;
                }
                match decode_payload(&data) {
                    Ok(bytes) => {
                        let _ = pending.body.send(Ok(Bytes::from(bytes)));
                    }
                    Err(e) => warn!("Dropping tunnel frame: bad http-chunk payload for {}: {}", id, e),
                }
            }
            TunnelFrame::HttpEnd { id } => {
                if let Some(pending) = state.http.remove(&id)
                    && let Some(head) = pending.head
                {
                    let _ = head.send(Err(RuntimeError::Protocol(
                        "http-end before http-res".to_string(),
                    )));
                }
            }
            TunnelFrame::HttpError { id, error } => {
                if let Some(pending) = state.http.remove(&id) {
                    match pending.head {
                        Some(head) => {
                            let _ = head.send(Err(RuntimeError::Remote(error)));
                        }
                        None => {
                            let _ = pending.body.send(Err(RuntimeError::Remote(error)));
                        }
                    }
                }
            }

            TunnelFrame::WsOpened { id } => {
                if let Some(opened) = state.sockets.get_mut(&id).and_then(|s| s.opened.take()) {
                    let _ = opened.send(Ok(()));
                }
            }
            TunnelFrame::WsMsg { id, data, binary } => {
                let Some(socket) = state.sockets.get(&id) else {
                    return;
                };
                let data = if binary {
                    match decode_payload(&data) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!("Dropping tunnel frame: bad ws-msg payload for {}: {}", id, e);
                            return;
                        }
                    }
                } else {
                    data.into_bytes()
                };
                let _ = socket.events.send(SocketEvent::Message { data, binary });
            }
            TunnelFrame::WsClose { id, code, reason } => {
                if let Some(socket) = state.sockets.remove(&id) {
                    match socket.opened {
                        Some(opened) => {
                            let _ = opened.send(Err(RuntimeError::Remote(
                                reason.unwrap_or_else(|| "closed before open".to_string()),
                            )));
                        }
                        None => {
                            let _ = socket.events.send(SocketEvent::Closed { code, reason });
                        }
                    }
                }
            }
            TunnelFrame::WsError { id, error } => {
                if let Some(socket) = state.sockets.remove(&id) {
                    match socket.opened {
                        Some(opened) => {
                            let _ = opened.send(Err(RuntimeError::Remote(error)));
                        }
                        None => {
                            let _ = socket.events.send(SocketEvent::Error(error));
                        }
                    }
                }
            }

            TunnelFrame::StartRuntime { id, .. }
            | TunnelFrame::HttpReq { id, .. }
            | TunnelFrame::WsOpen { id, .. } => {
                warn!("Dropping tunnel frame: provider-bound request {} sent to consumer", id);
            }
        }
    }

    fn send_frame(&self, frame: &TunnelFrame) -> RuntimeResult<()> {
        let text = frame
            .to_json()
            .map_err(|e| RuntimeError::Protocol(e.to_string()))?;
        let state = self.lock();
        let outbound = state
            .outbound
            .as_ref()
            .filter(|_| state.connected)
            .ok_or(RuntimeError::TunnelDisconnected)?;
        outbound
            .send(Message::Text(text.into()))
            .map_err(|_| RuntimeError::TunnelDisconnected)
    }

    fn ensure_available(&self) -> RuntimeResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(RuntimeError::TunnelDisconnected)
        }
    }

    /// Connected to the relay with a provider present.
    pub fn is_available(&self) -> bool {
        let state = self.lock();
        state.connected && state.provider_online
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Whether `port` belongs to a runtime started through the tunnel.
    pub fn is_tunnel_port(&self, port: u16) -> bool {
        self.lock().tunnel_ports.contains(&port)
    }

    /// Rewrite a cloud path with the learned mapping.
    pub fn map_path(&self, path: &str) -> String {
        self.lock().paths.rewrite(path)
    }

    /// Pending rpc, http and socket entries.
    pub fn pending_count(&self) -> usize {
        let state = self.lock();
        state.rpcs.len() + state.http.len() + state.sockets.len()
    }

    pub fn status(&self, enabled: bool) -> TunnelStatus {
        let state = self.lock();
        let mut tunnel_ports: Vec<u16> = state.tunnel_ports.iter().copied().collect();
        tunnel_ports.sort_unstable();
        TunnelStatus {
            enabled,
            connected: state.connected,
            provider_online: state.provider_online,
            provider: state.provider.clone(),
            pending: state.rpcs.len() + state.http.len() + state.sockets.len(),
            tunnel_ports,
            path_mappings: state
                .paths
                .mappings()
                .map(|(c, l)| (c.to_string(), l.to_string()))
                .collect(),
        }
    }

    /// Ask the provider to start a runtime for `project_root`.
    pub async fn start_runtime(
        &self,
        language: &str,
        project_root: &str,
        cwd: Option<String>,
        venv: Option<String>,
    ) -> RuntimeResult<RuntimeGrant> {
        self.ensure_available()?;
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.lock().rpcs.insert(
            id,
            PendingRpc {
                reply: tx,
                project_root: project_root.to_string(),
            },
        );
        let _guard = PendingGuard::new(self, PendingKind::Rpc, id);

        self.send_frame(&TunnelFrame::StartRuntime {
            id,
            language: language.to_string(),
            project_root: project_root.to_string(),
            cwd,
            venv,
        })?;

        let timeout = self.inner.options.rpc_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RuntimeError::TunnelDisconnected),
            Err(_) => {
                warn!("Tunnel start-runtime {} ({}) timed out", id, language);
                Err(RuntimeError::Timeout {
                    operation: format!("start-runtime {language}"),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send an HTTP request to `port` on the provider. Resolves once the
    /// response head arrives.
    pub async fn http_request(
        &self,
        port: u16,
        method: &str,
        path: &str,
        headers: BTreeMap<String, String>,
        body: Option<Bytes>,
    ) -> RuntimeResult<TunnelHttpResponse> {
        self.ensure_available()?;
        let id = self.next_id();
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        self.lock().http.insert(
            id,
            PendingHttp {
                head: Some(head_tx),
                body: body_tx,
            },
        );
        let guard = PendingGuard::new(self, PendingKind::Http, id);

        let frame = TunnelFrame::HttpReq {
            id,
            port,
            method: method.to_string(),
            path: path.to_string(),
            headers,
            body: body.filter(|b| !b.is_empty()).map(|b| encode_payload(&b)),
        };
        self.send_frame(&frame)?;

        let timeout = self.inner.options.rpc_timeout;
        match tokio::time::timeout(timeout, head_rx).await {
            Ok(Ok(Ok((status, headers)))) => {
                guard.disarm();
                Ok(TunnelHttpResponse {
                    status,
                    headers,
                    body: TunnelHttpBody {
                        id,
                        client: self.clone(),
                        chunks: UnboundedReceiverStream::new(body_rx),
                    },
                })
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(RuntimeError::TunnelDisconnected),
            Err(_) => {
                Err(RuntimeError::Timeout {
                    operation: format!("{method} {path} on tunnel port {port}"),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Open a socket to `port` on the provider. Paths in `target` are
    /// rewritten through the learned cloud-to-provider mapping.
    pub async fn open_socket(
        &self,
        port: u16,
        path: &str,
        target: SocketTarget,
    ) -> RuntimeResult<TunnelSocket> {
        self.ensure_available()?;
        let id = self.next_id();
        let (opened_tx, opened_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let frame = {
            let mut state = self.lock();
            state.sockets.insert(
                id,
                PendingSocket {
                    opened: Some(opened_tx),
                    events: events_tx,
                },
            );
            TunnelFrame::WsOpen {
                id,
                port,
                path: path.to_string(),
                cwd: target.cwd.map(|p| state.paths.rewrite(&p)),
                file: target.file.map(|p| state.paths.rewrite(&p)),
                session: target.session.map(|s| state.paths.rewrite_embedded(&s)),
            }
        };
        let guard = PendingGuard::new(self, PendingKind::Socket, id);
        self.send_frame(&frame)?;

        let timeout = self.inner.options.rpc_timeout;
        let result = match tokio::time::timeout(timeout, opened_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RuntimeError::TunnelDisconnected),
            Err(_) => Err(RuntimeError::Timeout {
                operation: format!("ws-open {path} on tunnel port {port}"),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };
        result?;
        guard.disarm();
        Ok(TunnelSocket {
            id,
            client: self.clone(),
            events: events_rx,
            closed: false,
        })
    }

    /// Drop socket state; tell the provider if it did not close first.
    fn forget_socket(&self, id: u64, code: Option<u16>, reason: Option<String>) {
        let removed = self.lock().sockets.remove(&id).is_some();
        if removed {
            let _ = self.send_frame(&TunnelFrame::WsClose { id, code, reason });
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PendingKind {
    Rpc,
    Http,
    Socket,
}

/// Removes a pending entry when the waiting caller goes away, whether by
/// reply, timeout or cancellation. Disarmed once a response handle takes
/// over the entry.
struct PendingGuard<'a> {
    client: &'a TunnelClient,
    kind: PendingKind,
    id: u64,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    fn new(client: &'a TunnelClient, kind: PendingKind, id: u64) -> Self {
        Self {
            client,
            kind,
            id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.kind {
            PendingKind::Rpc => {
                self.client.lock().rpcs.remove(&self.id);
            }
            PendingKind::Http => {
                self.client.lock().http.remove(&self.id);
            }
            // The provider may already have opened its side.
            PendingKind::Socket => self.client.forget_socket(self.id, None, None),
        }
    }
}

/// A socket tunneled to the provider.
#[derive(Debug)]
pub struct TunnelSocket {
    id: u64,
    client: TunnelClient,
    events: mpsc::UnboundedReceiver<SocketEvent>,
    closed: bool,
}

impl TunnelSocket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn send(&self, data: &[u8], binary: bool) -> RuntimeResult<()> {
        self.client
            .send_frame(&TunnelFrame::ws_message(self.id, data, binary))
    }

    /// Next relay-originated event. `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<SocketEvent> {
        self.events.recv().await
    }

    /// Close from the local side.
    pub fn close(mut self, code: Option<u16>, reason: Option<String>) {
        self.closed = true;
        self.client.forget_socket(self.id, code, reason);
    }

    /// Split into a sender usable from another task and the event stream.
    pub fn split(mut self) -> (TunnelSocketSender, mpsc::UnboundedReceiver<SocketEvent>) {
        self.closed = true;
        let (_, placeholder) = mpsc::unbounded_channel();
        let events = std::mem::replace(&mut self.events, placeholder);
        (
            TunnelSocketSender {
                id: self.id,
                client: self.client.clone(),
                closed: false,
            },
            events,
        )
    }
}

impl Drop for TunnelSocket {
    fn drop(&mut self) {
        if !self.closed {
            self.client.forget_socket(self.id, None, None);
        }
    }
}

/// Sending half of a split [`TunnelSocket`]. Dropping it closes the session.
#[derive(Debug)]
pub struct TunnelSocketSender {
    id: u64,
    client: TunnelClient,
    closed: bool,
}

impl TunnelSocketSender {
    pub fn send(&self, data: &[u8], binary: bool) -> RuntimeResult<()> {
        self.client
            .send_frame(&TunnelFrame::ws_message(self.id, data, binary))
    }

    pub fn close(mut self, code: Option<u16>, reason: Option<String>) {
        self.closed = true;
        self.client.forget_socket(self.id, code, reason);
    }
}

impl Drop for TunnelSocketSender {
    fn drop(&mut self) {
        if !self.closed {
            self.client.forget_socket(self.id, None, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::eventually;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::WebSocketStream;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    type Relay = WebSocketStream<TcpStream>;

    fn options(url: String, rpc_timeout: Duration) -> TunnelOptions {
        TunnelOptions {
            url,
            user: "u1".to_string(),
            token: Some("secret".to_string()),
            rpc_timeout,
            reconnect_delay: Duration::from_secs(30),
        }
    }

    /// Start a client against an in-process relay and bring the provider online.
    async fn connected(rpc_timeout: Duration) -> (TunnelClient, Relay, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/tunnel", listener.local_addr().unwrap());
        let client = TunnelClient::new(options(url, rpc_timeout));
        client.spawn();

        let (stream, _) = listener.accept().await.unwrap();
        let uri = Arc::new(Mutex::new(String::new()));
        let seen = Arc::clone(&uri);
        let mut relay = tokio_tungstenite::accept_hdr_async(
            stream,
            move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                *seen.lock().unwrap() = req.uri().to_string();
                Ok(resp)
            },
        )
        .await
        .unwrap();

        send(&mut relay, TunnelFrame::ProviderStatus { online: true }).await;
        let c = client.clone();
        assert!(eventually(Duration::from_secs(2), move || {
            let c = c.clone();
            async move { c.is_available() }
        })
        .await);
        let uri = uri.lock().unwrap().clone();
        (client, relay, uri)
    }

    async fn send(relay: &mut Relay, frame: TunnelFrame) {
        relay
            .send(Message::Text(frame.to_json().unwrap().into()))
            .await
            .unwrap();
    }

    async fn next_frame(relay: &mut Relay) -> TunnelFrame {
        loop {
            match relay.next().await.unwrap().unwrap() {
                Message::Text(text) => return TunnelFrame::parse(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_connects_as_consumer() {
        let (client, _relay, uri) = connected(Duration::from_secs(5)).await;
        assert_eq!(uri, "/tunnel?role=consumer&room=u1&token=secret");
        assert!(client.is_connected());
        client.shutdown();
    }

    #[tokio::test]
    async fn test_start_runtime_learns_ports_and_paths() {
        let (client, mut relay, _) = connected(Duration::from_secs(5)).await;

        let c = client.clone();
        let call = tokio::spawn(async move {
            c.start_runtime("python", "/cloud/u1/proj", None, None).await
        });

        let id = match next_frame(&mut relay).await {
            TunnelFrame::StartRuntime {
                id,
                language,
                project_root,
                ..
            } => {
                assert_eq!(language, "python");
                assert_eq!(project_root, "/cloud/u1/proj");
                id
            }
            other => panic!("unexpected frame: {other:?}"),
        };
        send(
            &mut relay,
            TunnelFrame::RuntimeStarted {
                id,
                port: 9100,
                ports: vec![9101],
                cwd: Some("/home/me/proj".to_string()),
                pid: Some(77),
            },
        )
        .await;

        let grant = call.await.unwrap().unwrap();
        assert_eq!(grant.port, 9100);
        assert!(client.is_tunnel_port(9100));
        assert!(client.is_tunnel_port(9101));
        assert_eq!(client.map_path("/cloud/u1/proj/a.qmd"), "/home/me/proj/a.qmd");
        assert_eq!(client.pending_count(), 0);
        client.shutdown();
    }

    #[tokio::test]
    async fn test_rpc_error_reply() {
        let (client, mut relay, _) = connected(Duration::from_secs(5)).await;
        let c = client.clone();
        let call = tokio::spawn(async move { c.start_runtime("r", "/p", None, None).await });

        let id = next_frame(&mut relay).await.id().unwrap();
        send(
            &mut relay,
            TunnelFrame::RuntimeError {
                id,
                error: "R not installed".to_string(),
            },
        )
        .await;

        assert_eq!(
            call.await.unwrap(),
            Err(RuntimeError::Remote("R not installed".to_string()))
        );
        assert_eq!(client.pending_count(), 0);
        client.shutdown();
    }

    #[tokio::test]
    async fn test_rpc_timeout_leaves_no_pending_entry() {
        let (client, mut relay, _) = connected(Duration::from_millis(200)).await;

        let c = client.clone();
        let call = tokio::spawn(async move { c.start_runtime("julia", "/p", None, None).await });
        let id = next_frame(&mut relay).await.id().unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout { timeout_ms: 200, .. }));
        assert_eq!(client.pending_count(), 0);

        // A reply after the deadline is ignored.
        send(
            &mut relay,
            TunnelFrame::RuntimeStarted {
                id,
                port: 9200,
                ports: Vec::new(),
                cwd: None,
                pid: None,
            },
        )
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!client.is_tunnel_port(9200));
        assert!(client.is_available());
        client.shutdown();
    }

    #[tokio::test]
    async fn test_streamed_http_preserves_chunk_order() {
        let (client, mut relay, _) = connected(Duration::from_secs(5)).await;
        let c = client.clone();
        let call = tokio::spawn(async move {
            let response = c
                .http_request(9100, "POST", "/api/run", BTreeMap::new(), Some(Bytes::from_static(b"x=1")))
                .await?;
            let status = response.status;
            let chunks: Vec<RuntimeResult<Bytes>> = response.into_body().collect().await;
            Ok::<_, RuntimeError>((status, chunks))
        });

        let id = match next_frame(&mut relay).await {
            TunnelFrame::HttpReq {
                id, method, body, ..
            } => {
                assert_eq!(method, "POST");
                assert_eq!(decode_payload(&body.unwrap()).unwrap(), b"x=1");
                id
            }
            other => panic!("unexpected frame: {other:?}"),
        };
        send(&mut relay, TunnelFrame::HttpRes { id, status: 201, headers: BTreeMap::new() }).await;
        for part in ["one", "two", "three"] {
            send(&mut relay, TunnelFrame::HttpChunk { id, data: encode_payload(part.as_bytes()) }).await;
        }
        send(&mut relay, TunnelFrame::HttpEnd { id }).await;

        let (status, chunks) = call.await.unwrap().unwrap();
        assert_eq!(status, 201);
        let body: Vec<u8> = chunks
            .into_iter()
            .flat_map(|chunk| chunk.unwrap().to_vec())
            .collect();
        assert_eq!(body, b"onetwothree");
        assert_eq!(client.pending_count(), 0);
        client.shutdown();
    }

    #[tokio::test]
    async fn test_http_error_before_and_after_headers() {
        let (client, mut relay, _) = connected(Duration::from_secs(5)).await;

        let c = client.clone();
        let early = tokio::spawn(async move {
            c.http_request(1, "GET", "/", BTreeMap::new(), None).await.map(|r| r.status)
        });
        let id = next_frame(&mut relay).await.id().unwrap();
        send(&mut relay, TunnelFrame::HttpError { id, error: "refused".to_string() }).await;
        assert_eq!(
            early.await.unwrap(),
            Err(RuntimeError::Remote("refused".to_string()))
        );

        let c = client.clone();
        let late = tokio::spawn(async move {
            let response = c.http_request(1, "GET", "/", BTreeMap::new(), None).await?;
            Ok::<_, RuntimeError>(response.into_body().collect::<Vec<_>>().await)
        });
        let id = next_frame(&mut relay).await.id().unwrap();
        send(&mut relay, TunnelFrame::HttpRes { id, status: 200, headers: BTreeMap::new() }).await;
        send(&mut relay, TunnelFrame::HttpChunk { id, data: encode_payload(b"partial") }).await;
        send(&mut relay, TunnelFrame::HttpError { id, error: "reset".to_string() }).await;

        let chunks = late.await.unwrap().unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].as_ref().unwrap().as_ref(), b"partial");
        assert_eq!(chunks[1], Err(RuntimeError::Remote("reset".to_string())));
        client.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped() {
        let (client, mut relay, _) = connected(Duration::from_secs(5)).await;
        let c = client.clone();
        let call = tokio::spawn(async move { c.start_runtime("python", "/p", None, None).await });
        let id = next_frame(&mut relay).await.id().unwrap();

        relay
            .send(Message::Text("{not json".to_string().into()))
            .await
            .unwrap();
        relay
            .send(Message::Text(r#"{"type":"mystery","id":1}"#.to_string().into()))
            .await
            .unwrap();
        send(
            &mut relay,
            TunnelFrame::RuntimeStarted {
                id,
                port: 9300,
                ports: Vec::new(),
                cwd: None,
                pid: None,
            },
        )
        .await;

        assert_eq!(call.await.unwrap().unwrap().port, 9300);
        assert!(client.is_available());
        client.shutdown();
    }

    #[tokio::test]
    async fn test_socket_messages_and_path_rewrite() {
        let (client, mut relay, _) = connected(Duration::from_secs(5)).await;

        // Learn a mapping first.
        let c = client.clone();
        let call = tokio::spawn(async move { c.start_runtime("python", "/cloud/p", None, None).await });
        let id = next_frame(&mut relay).await.id().unwrap();
        send(
            &mut relay,
            TunnelFrame::RuntimeStarted {
                id,
                port: 9100,
                ports: Vec::new(),
                cwd: Some("/local/p".to_string()),
                pid: None,
            },
        )
        .await;
        call.await.unwrap().unwrap();

        let c = client.clone();
        let open = tokio::spawn(async move {
            c.open_socket(
                9100,
                "/ws",
                SocketTarget {
                    cwd: Some("/cloud/p/sub".to_string()),
                    file: Some("/cloud/p/sub/a.qmd".to_string()),
                    session: Some("kernel:/cloud/p/sub/a.qmd".to_string()),
                },
            )
            .await
        });
        let id = match next_frame(&mut relay).await {
            TunnelFrame::WsOpen {
                id,
                cwd,
                file,
                session,
                ..
            } => {
                assert_eq!(cwd.as_deref(), Some("/local/p/sub"));
                assert_eq!(file.as_deref(), Some("/local/p/sub/a.qmd"));
                assert_eq!(session.as_deref(), Some("kernel:/local/p/sub/a.qmd"));
                id
            }
            other => panic!("unexpected frame: {other:?}"),
        };
        send(&mut relay, TunnelFrame::WsOpened { id }).await;
        let mut socket = open.await.unwrap().unwrap();

        socket.send(&[1, 2, 3], true).unwrap();
        match next_frame(&mut relay).await {
            TunnelFrame::WsMsg { data, binary, .. } => {
                assert!(binary);
                assert_eq!(decode_payload(&data).unwrap(), vec![1, 2, 3]);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        send(&mut relay, TunnelFrame::ws_message(id, b"hello", false)).await;
        assert_eq!(
            socket.recv().await,
            Some(SocketEvent::Message { data: b"hello".to_vec(), binary: false })
        );

        send(&mut relay, TunnelFrame::WsClose { id, code: Some(1000), reason: None }).await;
        assert_eq!(
            socket.recv().await,
            Some(SocketEvent::Closed { code: Some(1000), reason: None })
        );
        assert_eq!(socket.recv().await, None);
        assert_eq!(client.pending_count(), 0);
        client.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_rejects_everything() {
        let (client, mut relay, _) = connected(Duration::from_secs(10)).await;

        let mut sockets = Vec::new();
        for _ in 0..2 {
            let c = client.clone();
            let open = tokio::spawn(async move { c.open_socket(9100, "/ws", SocketTarget::default()).await });
            let id = next_frame(&mut relay).await.id().unwrap();
            send(&mut relay, TunnelFrame::WsOpened { id }).await;
            sockets.push(open.await.unwrap().unwrap());
        }

        let mut requests = Vec::new();
        for i in 0..5 {
            let c = client.clone();
            requests.push(tokio::spawn(async move {
                c.http_request(9100, "GET", &format!("/r/{i}"), BTreeMap::new(), None)
                    .await
                    .map(|r| r.status)
            }));
        }
        for _ in 0..5 {
            assert!(matches!(next_frame(&mut relay).await, TunnelFrame::HttpReq { .. }));
        }
        assert_eq!(client.pending_count(), 7);

        drop(relay);

        for request in requests {
            assert_eq!(request.await.unwrap(), Err(RuntimeError::TunnelDisconnected));
        }
        for socket in &mut sockets {
            match socket.recv().await {
                Some(SocketEvent::Closed { code, .. }) => assert_eq!(code, Some(CLOSE_TUNNEL_LOST)),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(!client.is_available());
        assert_eq!(client.pending_count(), 0);
        assert!(client.status(true).tunnel_ports.is_empty());
        client.shutdown();
    }

    #[tokio::test]
    async fn test_cancelled_http_caller_leaves_no_pending_entry() {
        let (client, mut relay, _) = connected(Duration::from_secs(10)).await;
        let c = client.clone();
        let call = tokio::spawn(async move {
            c.http_request(9100, "GET", "/slow", BTreeMap::new(), None)
                .await
                .map(|r| r.status)
        });
        assert!(matches!(next_frame(&mut relay).await, TunnelFrame::HttpReq { .. }));
        assert_eq!(client.pending_count(), 1);

        call.abort();
        let _ = call.await;
        assert_eq!(client.pending_count(), 0);
        client.shutdown();
    }

    #[tokio::test]
    async fn test_dropped_body_leaves_no_pending_entry() {
        let (client, mut relay, _) = connected(Duration::from_secs(10)).await;
        let c = client.clone();
        let call = tokio::spawn(async move { c.http_request(9100, "GET", "/big", BTreeMap::new(), None).await });
        let id = next_frame(&mut relay).await.id().unwrap();
        send(&mut relay, TunnelFrame::HttpRes { id, status: 200, headers: BTreeMap::new() }).await;

        let response = call.await.unwrap().unwrap();
        assert_eq!(client.pending_count(), 1);
        drop(response);
        assert_eq!(client.pending_count(), 0);

        // Chunks for the forgotten request are ignored.
        send(&mut relay, TunnelFrame::HttpChunk { id, data: encode_payload(b"late") }).await;
        send(&mut relay, TunnelFrame::HttpEnd { id }).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client.is_available());
        client.shutdown();
    }

    #[tokio::test]
    async fn test_cancelled_socket_open_closes_provider_side() {
        let (client, mut relay, _) = connected(Duration::from_secs(10)).await;
        let c = client.clone();
        let open = tokio::spawn(async move { c.open_socket(9100, "/ws", SocketTarget::default()).await.map(|s| s.id()) });
        let id = next_frame(&mut relay).await.id().unwrap();
        assert_eq!(client.pending_count(), 1);

        open.abort();
        let _ = open.await;
        assert_eq!(client.pending_count(), 0);
        match next_frame(&mut relay).await {
            TunnelFrame::WsClose { id: closed, .. } => assert_eq!(closed, id),
            other => panic!("unexpected frame: {other:?}"),
        }
        client.shutdown();
    }

    #[tokio::test]
    async fn test_unavailable_without_provider() {
        let client = TunnelClient::new(options("ws://127.0.0.1:1/tunnel".to_string(), Duration::from_secs(1)));
        assert!(!client.is_available());
        assert_eq!(
            client.start_runtime("python", "/p", None, None).await,
            Err(RuntimeError::TunnelDisconnected)
        );
        assert_eq!(client.pending_count(), 0);
    }
}
