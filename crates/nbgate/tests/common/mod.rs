//! Test utilities and common setup.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, Response, header},
    routing::get,
};
use nbgate::api::{AppState, create_router};
use nbgate::bridge::{BridgeManager, BridgeOptions};
use nbgate::cloud::{CloudOptions, CloudSessionService};
use nbgate::process::CommandLauncher;
use nbgate::resolver::{RuntimeResolver, default_languages};
use nbgate::runtime::{HealthProbe, RegistryOptions, RuntimeRegistry};
use nbgate::sync::{SyncOptions, SyncServerManager};
use nbgate::tunnel::{TunnelClient, TunnelOptions};
use serde_json::Value;

pub struct TestApp {
    pub router: Router,
    pub root: PathBuf,
    _tmp: tempfile::TempDir,
}

/// App wired to real services. No backend packages are installed, and the
/// tunnel client never connects.
pub fn test_app(cloud_port: u16) -> TestApp {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().to_path_buf();
    let launcher = Arc::new(CommandLauncher);

    let resolver = RuntimeResolver::new(default_languages())
        .with_env(|_| None)
        .with_bundled_dir(root.join("bundle"));
    let registry = RuntimeRegistry::new(
        resolver,
        launcher.clone(),
        HealthProbe::new("/api/capabilities", Duration::from_millis(500)),
        RegistryOptions {
            state_dir: Some(root.join("state")),
            ..RegistryOptions::default()
        },
    );
    let sync = SyncServerManager::new(
        SyncOptions {
            binary: "nbgate-sync-missing".to_string(),
            args: vec!["--port".to_string(), "{port}".to_string()],
            memory_limit_mb: 256,
            startup_timeout: Duration::from_secs(1),
            host: "127.0.0.1".to_string(),
            stop_grace: Duration::from_millis(200),
            state_dir: root.join("state"),
        },
        launcher,
    );
    let tunnel = TunnelClient::new(TunnelOptions {
        url: "ws://127.0.0.1:9".to_string(),
        user: "tester".to_string(),
        token: None,
        rpc_timeout: Duration::from_secs(1),
        reconnect_delay: Duration::from_secs(1),
    });
    let cloud = CloudSessionService::new(
        registry,
        Some(tunnel),
        CloudOptions {
            routed_languages: vec!["python".to_string()],
            host: "127.0.0.1".to_string(),
            port: cloud_port,
            probe_timeout: Duration::from_millis(500),
        },
    );
    let bridges = BridgeManager::new(BridgeOptions {
        relay_url: "ws://127.0.0.1:9/sync".to_string(),
        user: "tester".to_string(),
        reconnect_delay: Duration::from_secs(1),
    });

    TestApp {
        router: create_router(AppState::new(cloud, sync, bridges, false)),
        root,
        _tmp: tmp,
    }
}

/// A stand-in cloud runtime answering the capability probe.
pub async fn cloud_runtime() -> u16 {
    let app = Router::new().route("/api/capabilities", get(|| async { "{\"languages\":[\"python\"]}" }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    port
}

pub fn unused_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(method)
        .body(Body::empty())
        .unwrap()
}

pub fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(method)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

pub async fn read_json(response: Response<Body>) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}
