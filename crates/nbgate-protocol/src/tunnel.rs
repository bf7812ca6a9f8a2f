//! Tunnel frame types.
//!
//! Three sub-protocols share one relay connection:
//!
//! - RPC: `start-runtime` answered by `runtime-started` or `runtime-error`.
//! - Streamed HTTP: `http-req` answered by `http-res`, any number of
//!   `http-chunk`, then `http-end` or `http-error`.
//! - Tunneled sockets: `ws-open` answered by `ws-opened`, then `ws-msg` in both
//!   directions until `ws-close` or `ws-error`.
//!
//! Provider presence is announced with `provider-status`, `provider-gone` and
//! `provider-info`, none of which carry an id.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// A single tunnel frame, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum TunnelFrame {
    // -- RPC --
    /// Ask the provider to start (or reuse) a runtime.
    StartRuntime {
        id: u64,
        language: String,
        project_root: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        venv: Option<String>,
    },
    /// Runtime is reachable on the provider.
    RuntimeStarted {
        id: u64,
        port: u16,
        /// Additional ports the runtime exposes (all tunnel-routed).
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        ports: Vec<u16>,
        /// Working directory the provider actually used.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    RuntimeError {
        id: u64,
        error: String,
    },

    // -- Streamed HTTP --
    HttpReq {
        id: u64,
        port: u16,
        method: String,
        path: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        /// Base64 request body.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    HttpRes {
        id: u64,
        status: u16,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Base64 body chunk.
    HttpChunk {
        id: u64,
        data: String,
    },
    HttpEnd {
        id: u64,
    },
    HttpError {
        id: u64,
        error: String,
    },

    // -- Tunneled sockets --
    WsOpen {
        id: u64,
        port: u16,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
    WsOpened {
        id: u64,
    },
    /// Socket payload. Text is carried verbatim; binary is base64 with
    /// `binary: true`.
    WsMsg {
        id: u64,
        data: String,
        #[serde(default)]
        binary: bool,
    },
    WsClose {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    WsError {
        id: u64,
        error: String,
    },

    // -- Provider presence --
    ProviderStatus {
        online: bool,
    },
    ProviderGone,
    ProviderInfo {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hostname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        #[serde(default)]
        languages: Vec<String>,
    },
}

impl TunnelFrame {
    /// Parse a frame from a text message.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialize to the on-wire JSON text.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Correlation id, if this frame belongs to a request.
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::StartRuntime { id, .. }
            | Self::RuntimeStarted { id, .. }
            | Self::RuntimeError { id, .. }
            | Self::HttpReq { id, .. }
            | Self::HttpRes { id, .. }
            | Self::HttpChunk { id, .. }
            | Self::HttpEnd { id }
            | Self::HttpError { id, .. }
            | Self::WsOpen { id, .. }
            | Self::WsOpened { id }
            | Self::WsMsg { id, .. }
            | Self::WsClose { id, .. }
            | Self::WsError { id, .. } => Some(*id),
            Self::ProviderStatus { .. } | Self::ProviderGone | Self::ProviderInfo { .. } => None,
        }
    }

    /// Build a `ws-msg` frame, base64-encoding binary payloads.
    pub fn ws_message(id: u64, data: &[u8], binary: bool) -> Self {
        let data = if binary {
            encode_payload(data)
        } else {
            String::from_utf8_lossy(data).into_owned()
        };
        Self::WsMsg { id, data, binary }
    }
}

/// Encode bytes for a frame payload field.
pub fn encode_payload(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode a base64 frame payload field.
pub fn decode_payload(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_tags_are_kebab_case() {
        let frame = TunnelFrame::StartRuntime {
            id: 7,
            language: "python".to_string(),
            project_root: "/cloud/u1/proj".to_string(),
            cwd: None,
            venv: None,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "start-runtime");
        assert_eq!(value["projectRoot"], "/cloud/u1/proj");
        assert!(value.get("cwd").is_none());
    }

    #[test]
    fn test_parse_provider_gone_without_fields() {
        let frame = TunnelFrame::parse(r#"{"type":"provider-gone"}"#).unwrap();
        assert_eq!(frame, TunnelFrame::ProviderGone);
        assert_eq!(frame.id(), None);
    }

    #[test]
    fn test_parse_runtime_started_defaults() {
        let frame = TunnelFrame::parse(r#"{"type":"runtime-started","id":3,"port":9100}"#).unwrap();
        match frame {
            TunnelFrame::RuntimeStarted { id, port, ports, cwd, pid } => {
                assert_eq!(id, 3);
                assert_eq!(port, 9100);
                assert!(ports.is_empty());
                assert!(cwd.is_none());
                assert!(pid.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_binary_ws_message_is_base64() {
        let frame = TunnelFrame::ws_message(1, &[0, 159, 146, 150], true);
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["binary"], true);
        let data = value["data"].as_str().unwrap();
        assert_eq!(decode_payload(data).unwrap(), vec![0, 159, 146, 150]);
    }

    #[test]
    fn test_text_ws_message_is_verbatim() {
        let frame = TunnelFrame::ws_message(2, b"{\"op\":\"run\"}", false);
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "ws-msg", "id": 2, "data": "{\"op\":\"run\"}", "binary": false})
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(TunnelFrame::parse(r#"{"type":"nope","id":1}"#).is_err());
        assert!(TunnelFrame::parse("not json").is_err());
    }
}
