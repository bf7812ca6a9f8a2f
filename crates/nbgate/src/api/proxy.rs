//! HTTP and WebSocket proxying to provider ports over the relay tunnel.

use std::collections::BTreeMap;

use axum::{
    body::Body,
    extract::{
        Path, Query, Request, State,
        ws::{CloseFrame, Message as AxumMessage, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderName, HeaderValue, header},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::tunnel::{CLOSE_TUNNEL_LOST, SocketEvent, SocketTarget, TunnelClient};

/// Largest request body forwarded through the tunnel.
const MAX_TUNNEL_BODY: usize = 32 * 1024 * 1024;

/// Connection-scoped headers that must not cross the tunnel.
const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::HOST,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::TE,
    header::TRAILER,
];

fn available_tunnel(state: &AppState) -> ApiResult<TunnelClient> {
    state
        .tunnel()
        .filter(|t| t.is_available())
        .cloned()
        .ok_or_else(|| ApiError::ServiceUnavailable("no provider is connected to the relay".to_string()))
}

pub async fn tunnel_http_root(
    State(state): State<AppState>,
    Path(port): Path<u16>,
    req: Request,
) -> ApiResult<Response> {
    forward_http(&state, port, "", req).await
}

pub async fn tunnel_http(
    State(state): State<AppState>,
    Path((port, path)): Path<(u16, String)>,
    req: Request,
) -> ApiResult<Response> {
    forward_http(&state, port, &path, req).await
}

/// Forward one request. Errors before the response head become an error
/// response; errors after it abort the streamed body.
async fn forward_http(state: &AppState, port: u16, path: &str, req: Request) -> ApiResult<Response> {
    let tunnel = available_tunnel(state)?;

    let mut target = format!("/{}", path.trim_start_matches('/'));
    if let Some(query) = req.uri().query().filter(|q| !q.is_empty()) {
        target.push('?');
        target.push_str(query);
    }

    let (parts, body) = req.into_parts();
    let headers: BTreeMap<String, String> = parts
        .headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP.contains(*name))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let body = axum::body::to_bytes(body, MAX_TUNNEL_BODY)
        .await
        .map_err(|e| ApiError::bad_request(format!("failed to read request body: {e}")))?;

    debug!("Tunneling {} {} to provider port {}", parts.method, target, port);
    let response = tunnel
        .http_request(port, parts.method.as_str(), &target, headers, Some(body))
        .await?;

    let mut builder = Response::builder().status(response.status);
    for (name, value) in &response.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            warn!("Dropping invalid tunneled response header {:?}", name);
            continue;
        };
        if HOP_BY_HOP.contains(&name) || name == header::CONTENT_LENGTH {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from_stream(response.into_body()))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

#[derive(Debug, Default, Deserialize)]
pub struct TunnelSocketQuery {
    pub cwd: Option<String>,
    pub file: Option<String>,
    pub session: Option<String>,
}

pub async fn tunnel_ws(
    State(state): State<AppState>,
    Path((port, path)): Path<(u16, String)>,
    Query(query): Query<TunnelSocketQuery>,
    ws: WebSocketUpgrade,
) -> ApiResult<impl IntoResponse> {
    let tunnel = available_tunnel(&state)?;
    let path = format!("/{}", path.trim_start_matches('/'));
    let target = SocketTarget {
        cwd: query.cwd,
        file: query.file,
        session: query.session,
    };
    Ok(ws.on_upgrade(move |socket| async move {
        if let Err(e) = handle_tunnel_socket(socket, tunnel, port, path, target).await {
            debug!("Tunneled socket ended with error: {}", e);
        }
    }))
}

async fn handle_tunnel_socket(
    mut client_socket: WebSocket,
    tunnel: TunnelClient,
    port: u16,
    path: String,
    target: SocketTarget,
) -> anyhow::Result<()> {
    let remote = match tunnel.open_socket(port, &path, target).await {
        Ok(remote) => remote,
        Err(e) => {
            warn!("Failed to open tunneled socket to {}{}: {}", port, path, e);
            let _ = client_socket
                .send(AxumMessage::Close(Some(CloseFrame {
                    code: CLOSE_TUNNEL_LOST,
                    reason: e.to_string().into(),
                })))
                .await;
            return Ok(());
        }
    };
    debug!("Tunneled socket {} open to port {}{}", remote.id(), port, path);

    let (remote_tx, mut remote_rx) = remote.split();
    let (mut client_tx, mut client_rx) = client_socket.split();

    let client_to_remote = async {
        while let Some(msg) = client_rx.next().await {
            match msg? {
                AxumMessage::Text(text) => remote_tx.send(text.as_str().as_bytes(), false)?,
                AxumMessage::Binary(data) => remote_tx.send(&data, true)?,
                AxumMessage::Close(frame) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(frame.code), Some(frame.reason.to_string())),
                        None => (None, None),
                    };
                    return Ok::<_, anyhow::Error>((code, reason));
                }
                AxumMessage::Ping(_) | AxumMessage::Pong(_) => {}
            }
        }
        Ok((None, None))
    };

    let remote_to_client = async {
        while let Some(event) = remote_rx.recv().await {
            let forward = match event {
                SocketEvent::Message { data, binary: true } => AxumMessage::Binary(data.into()),
                SocketEvent::Message { data, binary: false } => {
                    AxumMessage::Text(String::from_utf8_lossy(&data).into_owned().into())
                }
                SocketEvent::Closed { code, reason } => {
                    client_tx
                        .send(AxumMessage::Close(Some(CloseFrame {
                            code: code.unwrap_or(1000),
                            reason: reason.unwrap_or_default().into(),
                        })))
                        .await?;
                    return Ok::<_, anyhow::Error>(());
                }
                SocketEvent::Error(message) => {
                    client_tx
                        .send(AxumMessage::Close(Some(CloseFrame {
                            code: CLOSE_TUNNEL_LOST,
                            reason: message.into(),
                        })))
                        .await?;
                    return Ok(());
                }
            };
            client_tx.send(forward).await?;
        }
        Ok(())
    };

    let closed_by_client = tokio::select! {
        result = client_to_remote => Some(result?),
        result = remote_to_client => {
            result?;
            None
        }
    };
    if let Some((code, reason)) = closed_by_client {
        remote_tx.close(code, reason);
    }

    Ok(())
}
