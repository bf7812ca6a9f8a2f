//! Path helpers shared by the runtime registry and sync manager.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Canonicalize `path`, falling back to the path as given if it does not exist.
pub fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Stable short hash of a canonicalized directory, used as a process key.
pub fn dir_hash(path: &Path) -> String {
    let canonical = canonical(path);
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    hex::encode(&digest[..8])
}

/// Resolve `value` against `base` unless it is already absolute. `~` is expanded.
pub fn resolve_against(base: &Path, value: &str) -> PathBuf {
    let expanded = PathBuf::from(shellexpand::tilde(value).as_ref());
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}
