//! HTTP API module.
//!
//! Thin axum transport over the orchestration services. No handler calls
//! another handler.

mod error;
pub mod handlers;
pub mod proxy;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
