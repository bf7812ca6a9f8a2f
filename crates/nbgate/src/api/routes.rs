//! API route definitions.

use axum::http::{Method, header};
use axum::{
    Router,
    routing::{any, get, post, put},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::proxy;
use super::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/health", get(handlers::health))
        // Runtimes
        .route(
            "/runtimes",
            get(handlers::list_runtimes).post(handlers::start_runtime),
        )
        .route(
            "/runtimes/{name}",
            get(handlers::get_runtime).delete(handlers::stop_runtime),
        )
        .route("/runtimes/{name}/restart", post(handlers::restart_runtime))
        .route("/runtimes/{name}/liveness", get(handlers::runtime_liveness))
        .route("/documents/runtimes", post(handlers::document_runtimes))
        .route("/cloud/runtime-port", put(handlers::update_runtime_port))
        // Sync servers
        .route("/sync", get(handlers::list_sync))
        .route("/sync/acquire", post(handlers::acquire_sync))
        .route("/sync/release", post(handlers::release_sync))
        .route("/sync/events", get(handlers::sync_events))
        // Relay bridges
        .route(
            "/bridges",
            get(handlers::list_bridges)
                .post(handlers::add_bridges)
                .delete(handlers::remove_bridges),
        )
        // Relay tunnel
        .route("/tunnel/status", get(handlers::tunnel_status))
        .route("/tunnel/http/{port}", any(proxy::tunnel_http_root))
        .route("/tunnel/http/{port}/{*path}", any(proxy::tunnel_http))
        .route("/tunnel/ws/{port}/{*path}", get(proxy::tunnel_ws))
        .layer(build_cors_layer())
        .layer(trace_layer)
        .with_state(state)
}

/// The editor runs in a browser on another origin.
fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::ORIGIN,
        ])
}
