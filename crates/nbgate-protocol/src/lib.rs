//! Wire types shared by nbgate components.
//!
//! ```text
//! Browser editor <--HTTP/WS--> nbgate (consumer) <--[tunnel frames]--> Relay <--> Provider (desktop)
//!                                    |
//!                              sync server(s) <--[raw sync bytes]--> Relay
//! ```
//!
//! The tunnel speaks one JSON object per WebSocket text frame. Every
//! request-shaped frame carries a consumer-chosen `id` which the provider echoes
//! on every response frame belonging to that request.

pub mod sync;
pub mod tunnel;

pub use sync::SyncEvent;
pub use tunnel::{TunnelFrame, decode_payload, encode_payload};
