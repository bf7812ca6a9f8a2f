//! Relay tunnel to a remote provider.

mod client;
mod path_map;

pub use client::{
    CLOSE_TUNNEL_LOST, ProviderInfo, RuntimeGrant, SocketEvent, SocketTarget, TunnelClient,
    TunnelHttpResponse, TunnelOptions, TunnelSocket, TunnelSocketSender, TunnelStatus,
};
pub use path_map::PathMap;
