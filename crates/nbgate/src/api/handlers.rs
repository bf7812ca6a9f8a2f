//! HTTP handlers. Each one is a thin adapter over a service method.

use std::collections::BTreeMap;
use std::path::PathBuf;

use axum::{
    Json,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
};
use nbgate_protocol::SyncEvent;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::bridge::ProjectBridgeStatus;
use crate::cloud::CloudLocation;
use crate::paths::{canonical, dir_hash};
use crate::runtime::{DocumentContext, RuntimeSession, StartConfig};
use crate::sync::SyncServerInfo;
use crate::tunnel::TunnelStatus;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// Runtimes

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRuntimeRequest {
    /// Defaults to `<language>-<dirHash(cwd)>`.
    pub name: Option<String>,
    pub language: String,
    pub cwd: PathBuf,
    pub venv: Option<PathBuf>,
    /// Defaults to `cwd`.
    pub project_root: Option<PathBuf>,
}

pub async fn list_runtimes(State(state): State<AppState>) -> Json<Vec<RuntimeSession>> {
    Json(state.cloud.list().await)
}

#[instrument(skip(state))]
pub async fn start_runtime(
    State(state): State<AppState>,
    Json(request): Json<StartRuntimeRequest>,
) -> ApiResult<Json<RuntimeSession>> {
    let language = request.language.trim().to_ascii_lowercase();
    if language.is_empty() {
        return Err(ApiError::bad_request("language is required"));
    }
    let name = request
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| format!("{}-{}", language, dir_hash(&request.cwd)));

    let session = state
        .cloud
        .start(StartConfig {
            name,
            language,
            cwd: request.cwd,
            venv: request.venv,
            project_root: request.project_root,
        })
        .await?;
    Ok(Json(session))
}

pub async fn get_runtime(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<RuntimeSession>> {
    state
        .cloud
        .attach(&name)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("runtime session not found: {name}")))
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub stopped: bool,
}

/// Always succeeds; `stopped` says whether anything was running.
#[instrument(skip(state))]
pub async fn stop_runtime(State(state): State<AppState>, Path(name): Path<String>) -> Json<StopResponse> {
    Json(StopResponse {
        stopped: state.cloud.stop(&name).await,
    })
}

#[instrument(skip(state))]
pub async fn restart_runtime(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<RuntimeSession>> {
    Ok(Json(state.cloud.restart(&name).await?))
}

#[derive(Debug, Serialize)]
pub struct LivenessResponse {
    pub name: String,
    pub alive: bool,
}

pub async fn runtime_liveness(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<LivenessResponse> {
    let alive = state.cloud.check_liveness(&name).await;
    Json(LivenessResponse { name, alive })
}

pub async fn document_runtimes(
    State(state): State<AppState>,
    Json(ctx): Json<DocumentContext>,
) -> ApiResult<Json<BTreeMap<String, RuntimeSession>>> {
    if ctx.project_root.as_os_str().is_empty() {
        return Err(ApiError::bad_request("projectRoot is required"));
    }
    Ok(Json(state.cloud.get_for_document(&ctx).await))
}

// Cloud

#[derive(Debug, Deserialize)]
pub struct RuntimePortRequest {
    pub port: u16,
    pub host: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RuntimePortResponse {
    pub location: CloudLocation,
    pub migrated: Vec<RuntimeSession>,
}

#[instrument(skip(state))]
pub async fn update_runtime_port(
    State(state): State<AppState>,
    Json(request): Json<RuntimePortRequest>,
) -> ApiResult<Json<RuntimePortResponse>> {
    if request.port == 0 {
        return Err(ApiError::bad_request("port must be non-zero"));
    }
    let migrated = state.cloud.update_runtime_port(request.port, request.host).await;
    Ok(Json(RuntimePortResponse {
        location: state.cloud.location(),
        migrated,
    }))
}

// Sync servers

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRequest {
    pub project_dir: PathBuf,
}

pub async fn list_sync(State(state): State<AppState>) -> Json<Vec<SyncServerInfo>> {
    Json(state.sync.list().await)
}

#[instrument(skip(state))]
pub async fn acquire_sync(
    State(state): State<AppState>,
    Json(request): Json<ProjectRequest>,
) -> ApiResult<Json<SyncServerInfo>> {
    if !request.project_dir.is_dir() {
        return Err(ApiError::bad_request(format!(
            "not a directory: {}",
            request.project_dir.display()
        )));
    }
    Ok(Json(state.sync.acquire(&request.project_dir).await?))
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub released: bool,
}

#[instrument(skip(state))]
pub async fn release_sync(
    State(state): State<AppState>,
    Json(request): Json<ProjectRequest>,
) -> Json<ReleaseResponse> {
    Json(ReleaseResponse {
        released: state.sync.release(&request.project_dir).await,
    })
}

/// Stream sync lifecycle events as JSON text frames.
pub async fn sync_events(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let events = state.sync.subscribe();
    ws.on_upgrade(move |socket| forward_sync_events(socket, events))
}

async fn forward_sync_events(mut socket: WebSocket, mut events: broadcast::Receiver<SyncEvent>) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Sync event subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("Sync event subscriber disconnected");
}

// Bridges

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddBridgesRequest {
    pub project_dir: PathBuf,
    /// Relay project name. Defaults to the directory name.
    pub project: Option<String>,
    /// Local sync server port. Defaults to the project's acquired sync server.
    pub local_port: Option<u16>,
    pub documents: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct AddBridgesResponse {
    pub added: Vec<String>,
    pub status: Option<ProjectBridgeStatus>,
}

pub async fn list_bridges(State(state): State<AppState>) -> Json<Vec<ProjectBridgeStatus>> {
    Json(state.bridges.status().await)
}

#[instrument(skip(state))]
pub async fn add_bridges(
    State(state): State<AppState>,
    Json(request): Json<AddBridgesRequest>,
) -> ApiResult<(StatusCode, Json<AddBridgesResponse>)> {
    let project_dir = canonical(&request.project_dir);
    let local_port = match request.local_port {
        Some(port) => port,
        None => state
            .sync
            .get(&project_dir)
            .await
            .map(|info| info.port)
            .ok_or_else(|| {
                ApiError::bad_request(format!(
                    "no sync server for {}; acquire one first or pass localPort",
                    project_dir.display()
                ))
            })?,
    };
    let project = request
        .project
        .filter(|p| !p.is_empty())
        .or_else(|| {
            project_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| dir_hash(&project_dir));

    let added = state
        .bridges
        .add_documents(&project_dir, &project, local_port, &request.documents)
        .await;
    let status = state.bridges.project_status(&project_dir).await;
    let code = if added.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((code, Json(AddBridgesResponse { added, status })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveBridgesRequest {
    pub project_dir: PathBuf,
    /// Only this document; the whole project if unset.
    pub document: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RemoveBridgesResponse {
    pub stopped: usize,
}

#[instrument(skip(state))]
pub async fn remove_bridges(
    State(state): State<AppState>,
    Json(request): Json<RemoveBridgesRequest>,
) -> Json<RemoveBridgesResponse> {
    let project_dir = canonical(&request.project_dir);
    let stopped = match request.document {
        Some(doc) => usize::from(state.bridges.remove_document(&project_dir, &doc).await),
        None => state.bridges.stop_project(&project_dir).await,
    };
    Json(RemoveBridgesResponse { stopped })
}

// Tunnel

pub async fn tunnel_status(State(state): State<AppState>) -> Json<TunnelStatus> {
    let status = match state.tunnel() {
        Some(tunnel) => tunnel.status(state.tunnel_enabled),
        None => TunnelStatus {
            enabled: false,
            connected: false,
            provider_online: false,
            provider: None,
            pending: 0,
            tunnel_ports: Vec::new(),
            path_mappings: BTreeMap::new(),
        },
    };
    Json(status)
}
