//! A single document's bridge between the local sync server and the relay.
//!
//! Each side runs its own connect loop. Messages read on one side go to the
//! other side's outbox: sent straight away if that side is open, otherwise
//! buffered and flushed in arrival order when it opens. A side's buffer is
//! dropped when that side disconnects; the sync protocol resumes on its own.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    fn other(self) -> Self {
        match self {
            Self::Local => Self::Remote,
            Self::Remote => Self::Local,
        }
    }
}

/// Outbound queue for one side.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    ready: Option<mpsc::UnboundedSender<Message>>,
    pending: VecDeque<Message>,
}

impl Outbox {
    pub(crate) fn push(&mut self, msg: Message) {
        if let Some(tx) = &self.ready {
            match tx.send(msg) {
                Ok(()) => return,
                Err(mpsc::error::SendError(msg)) => {
                    self.ready = None;
                    self.pending.push_back(msg);
                }
            }
        } else {
            self.pending.push_back(msg);
        }
    }

    /// Flush everything buffered into `tx`, then send through it directly.
    pub(crate) fn open(&mut self, tx: mpsc::UnboundedSender<Message>) {
        for msg in self.pending.drain(..) {
            if tx.send(msg).is_err() {
                break;
            }
        }
        self.ready = Some(tx);
    }

    pub(crate) fn disconnect(&mut self) {
        self.ready = None;
        self.pending.clear();
    }

    pub(crate) fn is_open(&self) -> bool {
        self.ready.is_some()
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocBridgeStatus {
    pub doc_name: String,
    pub local_connected: bool,
    pub remote_connected: bool,
    /// Messages waiting for the local side to open.
    pub pending_local: usize,
    /// Messages waiting for the remote side to open.
    pub pending_remote: usize,
    pub last_error: Option<String>,
}

struct DocBridgeInner {
    doc_name: String,
    local_url: String,
    remote_url: String,
    reconnect_delay: Duration,
    local: Mutex<Outbox>,
    remote: Mutex<Outbox>,
    last_error: Mutex<Option<String>>,
    cancel: CancellationToken,
}

/// Bidirectional forwarder for one document. Clones share the bridge.
#[derive(Clone)]
pub struct DocBridge {
    inner: Arc<DocBridgeInner>,
}

impl std::fmt::Debug for DocBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocBridge")
            .field("doc_name", &self.inner.doc_name)
            .field("local_url", &self.inner.local_url)
            .field("remote_url", &self.inner.remote_url)
            .finish()
    }
}

impl DocBridge {
    /// Create the bridge and start both connect loops.
    pub fn start(
        doc_name: impl Into<String>,
        local_url: impl Into<String>,
        remote_url: impl Into<String>,
        reconnect_delay: Duration,
    ) -> Self {
        let bridge = Self {
            inner: Arc::new(DocBridgeInner {
                doc_name: doc_name.into(),
                local_url: local_url.into(),
                remote_url: remote_url.into(),
                reconnect_delay,
                local: Mutex::new(Outbox::default()),
                remote: Mutex::new(Outbox::default()),
                last_error: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        };
        for side in [Side::Local, Side::Remote] {
            let this = bridge.clone();
            tokio::spawn(async move { this.run_side(side).await });
        }
        bridge
    }

    pub fn doc_name(&self) -> &str {
        &self.inner.doc_name
    }

    pub fn url(&self, side: Side) -> &str {
        match side {
            Side::Local => &self.inner.local_url,
            Side::Remote => &self.inner.remote_url,
        }
    }

    pub fn stop(&self) {
        debug!("Stopping bridge for {}", self.inner.doc_name);
        self.inner.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    fn outbox(&self, side: Side) -> MutexGuard<'_, Outbox> {
        let slot = match side {
            Side::Local => &self.inner.local,
            Side::Remote => &self.inner.remote,
        };
        slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_error(&self, error: String) {
        *self.inner.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(error);
    }

    pub fn status(&self) -> DocBridgeStatus {
        let (local_connected, pending_local) = {
            let outbox = self.outbox(Side::Local);
            (outbox.is_open(), outbox.pending())
        };
        let (remote_connected, pending_remote) = {
            let outbox = self.outbox(Side::Remote);
            (outbox.is_open(), outbox.pending())
        };
        DocBridgeStatus {
            doc_name: self.inner.doc_name.clone(),
            local_connected,
            remote_connected,
            pending_local,
            pending_remote,
            last_error: self
                .inner
                .last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }

    /// Both sides are open.
    pub fn is_connected(&self) -> bool {
        self.outbox(Side::Local).is_open() && self.outbox(Side::Remote).is_open()
    }

    async fn run_side(self, side: Side) {
        let cancel = self.inner.cancel.clone();
        while !cancel.is_cancelled() {
            let url = self.url(side).to_string();
            let connected = tokio::select! {
                res = tokio_tungstenite::connect_async(url.as_str()) => res,
                _ = cancel.cancelled() => break,
            };

            match connected {
                Ok((ws, _)) => {
                    debug!("Bridge {} {:?} side connected to {}", self.inner.doc_name, side, url);
                    self.pump(side, ws, &cancel).await;
                    self.outbox(side).disconnect();
                }
                Err(e) => {
                    debug!("Bridge {} {:?} side failed to connect to {}: {}", self.inner.doc_name, side, url, e);
                    self.set_error(format!("{side:?} connect failed: {e}"));
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.inner.reconnect_delay) => {}
                _ = cancel.cancelled() => break,
            }
        }
        self.outbox(side).disconnect();
    }

    async fn pump<S>(&self, side: Side, ws: tokio_tungstenite::WebSocketStream<S>, cancel: &CancellationToken)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.outbox(side).open(tx);
        if self.outbox(side.other()).is_open() {
            info!("Bridge for {} is connected on both sides", self.inner.doc_name);
        }

        loop {
            tokio::select! {
                outgoing = rx.recv() => match outgoing {
                    Some(msg) => {
                        if let Err(e) = sink.send(msg).await {
                            self.set_error(format!("{side:?} send failed: {e}"));
                            break;
                        }
                    }
                    None => break,
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(msg @ (Message::Binary(_) | Message::Text(_)))) => {
                        self.outbox(side.other()).push(msg);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Bridge {} {:?} side closed: {:?}", self.inner.doc_name, side, frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Bridge {} {:?} side error: {}", self.inner.doc_name, side, e);
                        self.set_error(format!("{side:?} read failed: {e}"));
                        break;
                    }
                    None => break,
                },
                _ = cancel.cancelled() => {
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    }
}
