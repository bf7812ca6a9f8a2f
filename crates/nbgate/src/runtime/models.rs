//! Runtime session data models.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::paths::{dir_hash, resolve_against};

/// Where a session's backend executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    /// Spawned and owned by this process.
    Local,
    /// Reached through a URL override or the relay tunnel.
    Remote,
    /// Pre-provisioned runtime at the configured cloud host.
    Cloud,
}

/// Session lifecycle.
///
/// Local sessions move `starting -> alive -> dying -> gone`; remote and cloud
/// sessions go straight from `alive` to `gone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Alive,
    Dying,
    Gone,
}

/// Request to start a runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartConfig {
    /// Unique session name.
    pub name: String,
    pub language: String,
    pub cwd: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venv: Option<PathBuf>,
    /// Root of the project `cwd` belongs to. Defaults to `cwd`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_root: Option<PathBuf>,
}

impl StartConfig {
    pub fn project_root(&self) -> &Path {
        self.project_root.as_deref().unwrap_or(&self.cwd)
    }
}

/// A runtime known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSession {
    pub name: String,
    pub language: String,
    pub port: u16,
    pub host: String,
    /// `None` for remote and cloud sessions.
    pub pid: Option<u32>,
    pub cwd: PathBuf,
    pub started_at: DateTime<Utc>,
    pub mode: RuntimeMode,
    pub alive: bool,
    pub state: SessionState,
    pub last_error: Option<String>,
    /// Traffic to this runtime goes through the relay tunnel.
    #[serde(default)]
    pub via_tunnel: bool,
}

impl RuntimeSession {
    /// A live session record.
    pub fn alive(
        config: &StartConfig,
        mode: RuntimeMode,
        host: impl Into<String>,
        port: u16,
        pid: Option<u32>,
    ) -> Self {
        Self {
            name: config.name.clone(),
            language: config.language.clone(),
            port,
            host: host.into(),
            pid,
            cwd: config.cwd.clone(),
            started_at: Utc::now(),
            mode,
            alive: true,
            state: SessionState::Alive,
            last_error: None,
            via_tunnel: false,
        }
    }

    /// Descriptor for a runtime that could not be provided.
    pub fn failed(
        name: impl Into<String>,
        language: impl Into<String>,
        cwd: PathBuf,
        error: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            language: language.into(),
            port: 0,
            host: String::new(),
            pid: None,
            cwd,
            started_at: Utc::now(),
            mode: RuntimeMode::Local,
            alive: false,
            state: SessionState::Gone,
            last_error: Some(error.into()),
            via_tunnel: false,
        }
    }

    pub fn mark_gone(&mut self, error: Option<String>) {
        self.alive = false;
        self.state = SessionState::Gone;
        self.last_error = error;
    }

    /// Base URL of the backend.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Runtime hints from a project's configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub runtime: Option<String>,
    pub runtimes: Vec<String>,
    /// Relative to the project root.
    pub cwd: Option<String>,
    /// Relative to the project root.
    pub venv: Option<String>,
}

/// Runtime hints from a document's frontmatter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Frontmatter {
    pub runtime: Option<String>,
    pub runtimes: Vec<String>,
    /// Relative to the document's directory.
    pub cwd: Option<String>,
    /// Relative to the document's directory.
    pub venv: Option<String>,
}

/// Everything known about a document when asking for its runtimes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentContext {
    pub path: PathBuf,
    pub project_root: PathBuf,
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub frontmatter: Frontmatter,
}

impl DocumentContext {
    fn doc_dir(&self) -> &Path {
        self.path.parent().unwrap_or(&self.project_root)
    }

    /// Languages the document wants, most specific declaration first.
    pub fn languages(&self, default_language: &str) -> Vec<String> {
        let declared = if !self.frontmatter.runtimes.is_empty() {
            self.frontmatter.runtimes.clone()
        } else if let Some(lang) = &self.frontmatter.runtime {
            vec![lang.clone()]
        } else if !self.project.runtimes.is_empty() {
            self.project.runtimes.clone()
        } else if let Some(lang) = &self.project.runtime {
            vec![lang.clone()]
        } else {
            vec![default_language.to_string()]
        };

        let mut languages: Vec<String> = Vec::with_capacity(declared.len());
        for lang in declared {
            let lang = lang.trim().to_ascii_lowercase();
            if !lang.is_empty() && !languages.contains(&lang) {
                languages.push(lang);
            }
        }
        languages
    }

    /// Project-scoped session name for `language`.
    pub fn session_name(&self, language: &str) -> String {
        format!(
            "{}-{}",
            language.to_ascii_lowercase(),
            dir_hash(&self.project_root)
        )
    }

    /// Working directory for the document's runtimes.
    pub fn infer_cwd(&self) -> PathBuf {
        if let Some(cwd) = &self.frontmatter.cwd {
            return resolve_against(self.doc_dir(), cwd);
        }
        if let Some(cwd) = &self.project.cwd {
            return resolve_against(&self.project_root, cwd);
        }
        self.project_root.clone()
    }

    /// Virtual environment for Python runtimes.
    pub fn infer_venv(&self, language: &str) -> Option<PathBuf> {
        if !language.eq_ignore_ascii_case("python") {
            return None;
        }
        if let Some(venv) = &self.frontmatter.venv {
            return Some(resolve_against(self.doc_dir(), venv));
        }
        if let Some(venv) = &self.project.venv {
            return Some(resolve_against(&self.project_root, venv));
        }
        let local = self.project_root.join(".venv");
        local.is_dir().then_some(local)
    }
}
