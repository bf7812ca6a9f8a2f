use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::info;
use serde::Serialize;
use tokio::sync::Mutex;

use super::doc::{DocBridge, DocBridgeStatus};
use crate::config::BridgeConfig;

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Relay sync base URL, e.g. `wss://relay.example.com/sync`.
    pub relay_url: String,
    pub user: String,
    pub reconnect_delay: Duration,
}

impl BridgeOptions {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            relay_url: config.url.clone(),
            user: config.user.clone(),
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
        }
    }

    pub fn local_url(&self, port: u16, doc_name: &str) -> String {
        format!("ws://127.0.0.1:{}/{}", port, urlencoding::encode(doc_name))
    }

    pub fn remote_url(&self, project: &str, doc_name: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.relay_url.trim_end_matches('/'),
            urlencoding::encode(&self.user),
            urlencoding::encode(project),
            urlencoding::encode(doc_name)
        )
    }
}

struct ProjectBridges {
    project: String,
    local_port: u16,
    docs: BTreeMap<String, DocBridge>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectBridgeStatus {
    pub project_dir: PathBuf,
    pub project: String,
    pub local_port: u16,
    /// Documents with both sides connected.
    pub connected: usize,
    pub total: usize,
    pub documents: Vec<DocBridgeStatus>,
}

/// Bridges indexed by project directory, then document name.
#[derive(Clone)]
pub struct BridgeManager {
    options: BridgeOptions,
    projects: Arc<Mutex<HashMap<PathBuf, ProjectBridges>>>,
}

impl BridgeManager {
    pub fn new(options: BridgeOptions) -> Self {
        Self {
            options,
            projects: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    /// Bridge `docs` for a project whose sync server listens on `local_port`.
    ///
    /// Documents that are already bridged are left alone. If the sync server
    /// moved to a new port, existing bridges are restarted against it.
    /// Returns the names of newly started bridges.
    pub async fn add_documents(
        &self,
        project_dir: &Path,
        project: &str,
        local_port: u16,
        docs: &[String],
    ) -> Vec<String> {
        let mut projects = self.projects.lock().await;
        let entry = projects
            .entry(project_dir.to_path_buf())
            .or_insert_with(|| ProjectBridges {
                project: project.to_string(),
                local_port,
                docs: BTreeMap::new(),
            });

        if entry.local_port != local_port || entry.project != project {
            info!(
                "Sync server for {} moved to port {}, restarting {} bridge(s)",
                project_dir.display(),
                local_port,
                entry.docs.len()
            );
            entry.local_port = local_port;
            entry.project = project.to_string();
            let names: Vec<String> = entry.docs.keys().cloned().collect();
            for name in names {
                if let Some(old) = entry.docs.remove(&name) {
                    old.stop();
                }
                let bridge = self.start_bridge(&entry.project, local_port, &name);
                entry.docs.insert(name, bridge);
            }
        }

        let mut added = Vec::new();
        for doc in docs {
            if entry.docs.contains_key(doc) {
                continue;
            }
            let bridge = self.start_bridge(&entry.project, local_port, doc);
            entry.docs.insert(doc.clone(), bridge);
            added.push(doc.clone());
        }
        if !added.is_empty() {
            info!(
                "Bridging {} new document(s) for {} ({} total)",
                added.len(),
                project_dir.display(),
                entry.docs.len()
            );
        }
        added
    }

    fn start_bridge(&self, project: &str, local_port: u16, doc: &str) -> DocBridge {
        DocBridge::start(
            doc,
            self.options.local_url(local_port, doc),
            self.options.remote_url(project, doc),
            self.options.reconnect_delay,
        )
    }

    pub async fn remove_document(&self, project_dir: &Path, doc: &str) -> bool {
        let mut projects = self.projects.lock().await;
        let Some(entry) = projects.get_mut(project_dir) else {
            return false;
        };
        let removed = match entry.docs.remove(doc) {
            Some(bridge) => {
                bridge.stop();
                true
            }
            None => false,
        };
        if entry.docs.is_empty() {
            projects.remove(project_dir);
        }
        removed
    }

    /// Stop every bridge of a project. Returns how many were stopped.
    pub async fn stop_project(&self, project_dir: &Path) -> usize {
        let entry = self.projects.lock().await.remove(project_dir);
        match entry {
            Some(entry) => {
                for bridge in entry.docs.values() {
                    bridge.stop();
                }
                info!("Stopped {} bridge(s) for {}", entry.docs.len(), project_dir.display());
                entry.docs.len()
            }
            None => 0,
        }
    }

    pub async fn stop_all(&self) -> usize {
        let drained: Vec<ProjectBridges> = self.projects.lock().await.drain().map(|(_, v)| v).collect();
        let mut stopped = 0;
        for entry in drained {
            for bridge in entry.docs.values() {
                bridge.stop();
                stopped += 1;
            }
        }
        stopped
    }

    pub async fn status(&self) -> Vec<ProjectBridgeStatus> {
        let projects = self.projects.lock().await;
        let mut out: Vec<ProjectBridgeStatus> = projects
            .iter()
            .map(|(dir, entry)| {
                let documents: Vec<DocBridgeStatus> = entry.docs.values().map(DocBridge::status).collect();
                ProjectBridgeStatus {
                    project_dir: dir.clone(),
                    project: entry.project.clone(),
                    local_port: entry.local_port,
                    connected: documents
                        .iter()
                        .filter(|d| d.local_connected && d.remote_connected)
                        .count(),
                    total: documents.len(),
                    documents,
                }
            })
            .collect();
        out.sort_by(|a, b| a.project_dir.cmp(&b.project_dir));
        out
    }

    pub async fn project_status(&self, project_dir: &Path) -> Option<ProjectBridgeStatus> {
        self.status()
            .await
            .into_iter()
            .find(|s| s.project_dir == project_dir)
    }
}
