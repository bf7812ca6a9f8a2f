//! Application state shared across handlers.

use crate::bridge::BridgeManager;
use crate::cloud::CloudSessionService;
use crate::sync::SyncServerManager;
use crate::tunnel::TunnelClient;

/// Service handles. Every handler goes through one of these; cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub cloud: CloudSessionService,
    pub sync: SyncServerManager,
    pub bridges: BridgeManager,
    /// Whether the relay tunnel is configured on. The client exists either way.
    pub tunnel_enabled: bool,
}

impl AppState {
    pub fn new(
        cloud: CloudSessionService,
        sync: SyncServerManager,
        bridges: BridgeManager,
        tunnel_enabled: bool,
    ) -> Self {
        Self {
            cloud,
            sync,
            bridges,
            tunnel_enabled,
        }
    }

    pub fn tunnel(&self) -> Option<&TunnelClient> {
        self.cloud.tunnel()
    }
}
