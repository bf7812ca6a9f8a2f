//! nbgate: runtime orchestration for browser-hosted notebooks.
//!
//! Starts and tracks language backends, shares one sync server per project,
//! bridges document sync to a relay, and tunnels runtime traffic to a remote
//! provider when one is connected.

pub mod api;
pub mod bridge;
pub mod cloud;
pub mod config;
pub mod error;
pub mod inflight;
pub mod paths;
pub mod process;
pub mod resolver;
pub mod runtime;
pub mod sync;
pub mod tunnel;

#[cfg(test)]
mod testing;

pub use error::{RuntimeError, RuntimeResult};
