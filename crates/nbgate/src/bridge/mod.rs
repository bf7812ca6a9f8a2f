//! Per-document bridges between local sync servers and the relay.

mod doc;
mod manager;

pub use doc::{DocBridge, DocBridgeStatus, Side};
pub use manager::{BridgeManager, BridgeOptions, ProjectBridgeStatus};
