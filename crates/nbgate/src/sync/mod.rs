//! Document sync servers.

mod manager;
mod marker;

pub use manager::{SyncOptions, SyncServerInfo, SyncServerManager};
pub use marker::{SyncMarker, marker_path};
