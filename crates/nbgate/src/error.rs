//! Runtime orchestration error types.

use thiserror::Error;

/// Result type for orchestration operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors surfaced by the resolver, supervisor, sync manager, tunnel and
/// cloud session service.
///
/// Payloads are plain strings so a single failed in-flight start can be
/// cloned out to every caller waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    /// No viable runtime location for a language.
    #[error("no runtime available for language '{0}'")]
    Resolution(String),

    /// The backend port never became reachable. The spawned process was killed.
    #[error("{name} did not become reachable on port {port} within {timeout_secs}s")]
    StartupTimeout {
        name: String,
        port: u16,
        timeout_secs: u64,
    },

    /// Remote/cloud runtime failed its capability probe.
    #[error("remote runtime at {url} is unreachable: {message}")]
    UnreachableRemote { url: String, message: String },

    /// A local process died outside a requested stop.
    #[error("{name} exited unexpectedly: {reason}")]
    UnexpectedExit { name: String, reason: String },

    /// The relay link dropped while the operation was pending.
    #[error("tunnel disconnected")]
    TunnelDisconnected,

    /// Malformed or unexpected tunnel frame.
    #[error("tunnel protocol error: {0}")]
    Protocol(String),

    /// A tunnel request got no reply in time.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The provider answered a request with an error.
    #[error("provider error: {0}")]
    Remote(String),

    /// The OS refused to launch a process.
    #[error("failed to spawn {name}: {message}")]
    Spawn { name: String, message: String },

    /// Restart of a session name that has no recorded configuration.
    #[error("runtime session not found: {0}")]
    UnknownSession(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
