//! `{pid, port}` liveness marker for sync servers.
//!
//! Lives at `<state_dir>/sync/<dir_hash>/server.json` and outlives this
//! process, so a restarted gateway can adopt a sync server instead of
//! starting a second one for the same project.

use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMarker {
    pub pid: u32,
    pub port: u16,
}

pub fn marker_path(state_dir: &Path, dir_hash: &str) -> PathBuf {
    state_dir.join("sync").join(dir_hash).join("server.json")
}

pub fn read_marker(path: &Path) -> Option<SyncMarker> {
    let raw = std::fs::read(path).ok()?;
    match serde_json::from_slice(&raw) {
        Ok(marker) => Some(marker),
        Err(e) => {
            warn!("Ignoring unreadable sync marker {}: {}", path.display(), e);
            None
        }
    }
}

pub fn write_marker(path: &Path, marker: SyncMarker) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_vec(&marker).map_err(std::io::Error::other)?;
    std::fs::write(path, body)
}

/// Remove the marker if it still names `pid`. Any pid matches when `None`.
pub fn remove_marker(path: &Path, pid: Option<u32>) {
    if let Some(pid) = pid
        && read_marker(path).is_some_and(|marker| marker.pid != pid)
    {
        return;
    }
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove sync marker {}: {}", path.display(), e),
    }
}
