//! Sync server lifecycle events.

use serde::{Deserialize, Serialize};

/// Lifecycle notifications for per-project sync servers, tagged by `event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A new owned sync server became reachable.
    Started {
        project_dir: String,
        port: u16,
        pid: u32,
    },
    /// An already-running sync server was adopted from its liveness marker.
    Adopted {
        project_dir: String,
        port: u16,
        pid: u32,
    },
    /// An owned sync server exited after a requested stop.
    Stopped { project_dir: String },
    /// A sync server exited without being asked to. Unsaved document state
    /// held only by that process may be lost.
    Died {
        project_dir: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
        reason: String,
    },
}

impl SyncEvent {
    pub fn project_dir(&self) -> &str {
        match self {
            Self::Started { project_dir, .. }
            | Self::Adopted { project_dir, .. }
            | Self::Stopped { project_dir }
            | Self::Died { project_dir, .. } => project_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_died_event_shape() {
        let event = SyncEvent::Died {
            project_dir: "/proj".to_string(),
            exit_code: None,
            signal: Some(9),
            reason: "killed by SIGKILL (signal 9)".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "died");
        assert_eq!(value["signal"], 9);
        assert!(value.get("exit_code").is_none());
        assert_eq!(event.project_dir(), "/proj");
    }
}
