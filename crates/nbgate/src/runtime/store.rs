//! Persisted record of live local runtimes (`runtimes.json`).
//!
//! Written on every successful local start and pruned on stop or exit, so a
//! restarted server can find processes a previous instance left behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::warn;
use serde::{Deserialize, Serialize};

const FILE_NAME: &str = "runtimes.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRuntime {
    pub pid: u32,
    pub port: u16,
    pub language: String,
    pub cwd: PathBuf,
}

#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StateStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(FILE_NAME),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> BTreeMap<String, PersistedRuntime> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.read()
    }

    pub fn upsert(&self, name: &str, record: PersistedRuntime) {
        self.modify(|entries| {
            entries.insert(name.to_string(), record);
        });
    }

    pub fn remove(&self, name: &str) {
        self.modify(|entries| {
            entries.remove(name);
        });
    }

    pub fn clear(&self) {
        self.modify(BTreeMap::clear);
    }

    fn modify(&self, f: impl FnOnce(&mut BTreeMap<String, PersistedRuntime>)) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.read();
        f(&mut entries);
        if let Err(e) = self.write(&entries) {
            warn!("Failed to write {}: {}", self.path.display(), e);
        }
    }

    fn read(&self) -> BTreeMap<String, PersistedRuntime> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(e) => {
                warn!("Failed to read {}: {}", self.path.display(), e);
                return BTreeMap::new();
            }
        };
        serde_json::from_slice(&raw).unwrap_or_else(|e| {
            warn!("Ignoring corrupt {}: {}", self.path.display(), e);
            BTreeMap::new()
        })
    }

    fn write(&self, entries: &BTreeMap<String, PersistedRuntime>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(entries).map_err(std::io::Error::other)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)
    }
}
