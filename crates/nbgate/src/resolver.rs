//! Runtime location resolution.
//!
//! Decides where a language backend lives. Checks run in strict priority order
//! and stop at the first hit:
//!
//! 1. `NBGATE_<LANG>_RUNTIME_URL` - a remote backend, no further checks.
//! 2. `NBGATE_<LANG>_RUNTIME_DIR` - an explicit package directory.
//! 3. Candidate directories from the configured [`CandidateSource`]s.
//! 4. The bundled fallback directory, `<bundled_dir>/<lang>`.
//!
//! Every local candidate is validated by the presence of the language's
//! marker file. Resolution only reads the environment and the filesystem, so
//! it is deterministic for fixed inputs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// How to recognize and launch a language backend package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageSpec {
    /// File that must exist in the package directory.
    pub marker: String,
    /// Entry point, relative to the package directory.
    pub entry: String,
    /// Program used to run the entry point. Runs the entry directly if unset.
    pub interpreter: Option<String>,
    /// How long to wait for the backend port to accept connections.
    pub startup_timeout_secs: u64,
    /// Whether the backend accepts `--cwd DIR`.
    pub accepts_cwd: bool,
    /// Extra arguments appended after `--port`/`--cwd`.
    pub args: Vec<String>,
}

impl Default for LanguageSpec {
    fn default() -> Self {
        Self {
            marker: "runtime.json".to_string(),
            entry: "server".to_string(),
            interpreter: None,
            startup_timeout_secs: 15,
            accepts_cwd: true,
            args: Vec::new(),
        }
    }
}

/// Built-in language definitions.
pub fn default_languages() -> BTreeMap<String, LanguageSpec> {
    let mut languages = BTreeMap::new();
    languages.insert(
        "python".to_string(),
        LanguageSpec {
            marker: "pyproject.toml".to_string(),
            entry: "nbgate_runtime/server.py".to_string(),
            interpreter: Some("python3".to_string()),
            startup_timeout_secs: 15,
            ..LanguageSpec::default()
        },
    );
    languages.insert(
        "r".to_string(),
        LanguageSpec {
            marker: "DESCRIPTION".to_string(),
            entry: "inst/server.R".to_string(),
            interpreter: Some("Rscript".to_string()),
            startup_timeout_secs: 30,
            ..LanguageSpec::default()
        },
    );
    // Julia compiles on first load; give it much longer.
    languages.insert(
        "julia".to_string(),
        LanguageSpec {
            marker: "Project.toml".to_string(),
            entry: "src/server.jl".to_string(),
            interpreter: Some("julia".to_string()),
            startup_timeout_secs: 120,
            ..LanguageSpec::default()
        },
    );
    languages
}

/// Where a language backend lives. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ResolvedLocation {
    Remote {
        url: String,
    },
    Local {
        package_dir: PathBuf,
        entry_point: PathBuf,
    },
}

/// Supplies candidate package directories for a language.
pub trait CandidateSource: Send + Sync {
    fn candidates(&self, language: &str) -> Vec<PathBuf>;
}

/// Co-located development layout: `<root>/<lang>-runtime` and
/// `<root>/runtimes/<lang>` for each configured root, in order.
#[derive(Debug, Clone, Default)]
pub struct SiblingLayout {
    roots: Vec<PathBuf>,
}

impl SiblingLayout {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }
}

impl CandidateSource for SiblingLayout {
    fn candidates(&self, language: &str) -> Vec<PathBuf> {
        self.roots
            .iter()
            .flat_map(|root| {
                [
                    root.join(format!("{language}-runtime")),
                    root.join("runtimes").join(language),
                ]
            })
            .collect()
    }
}

/// A fixed list of directories, independent of language.
#[derive(Debug, Clone, Default)]
pub struct FixedCandidates(pub Vec<PathBuf>);

impl CandidateSource for FixedCandidates {
    fn candidates(&self, _language: &str) -> Vec<PathBuf> {
        self.0.clone()
    }
}

/// Environment variable lookup.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

fn process_env() -> EnvLookup {
    Arc::new(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
}

/// Environment variable holding a remote URL override for `language`.
pub fn remote_url_var(language: &str) -> String {
    format!("NBGATE_{}_RUNTIME_URL", env_token(language))
}

/// Environment variable holding an explicit package directory for `language`.
pub fn runtime_dir_var(language: &str) -> String {
    format!("NBGATE_{}_RUNTIME_DIR", env_token(language))
}

fn env_token(language: &str) -> String {
    language
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Resolves language names to backend locations.
#[derive(Clone)]
pub struct RuntimeResolver {
    languages: BTreeMap<String, LanguageSpec>,
    env: EnvLookup,
    candidates: Vec<Arc<dyn CandidateSource>>,
    bundled_dir: Option<PathBuf>,
}

impl std::fmt::Debug for RuntimeResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeResolver")
            .field("languages", &self.languages.keys().collect::<Vec<_>>())
            .field("candidate_sources", &self.candidates.len())
            .field("bundled_dir", &self.bundled_dir)
            .finish()
    }
}

impl RuntimeResolver {
    /// Resolver reading the process environment, with no candidate sources
    /// and no bundled fallback.
    pub fn new(languages: BTreeMap<String, LanguageSpec>) -> Self {
        Self {
            languages,
            env: process_env(),
            candidates: Vec::new(),
            bundled_dir: None,
        }
    }

    /// Replace the environment lookup.
    pub fn with_env(mut self, env: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        self.env = Arc::new(env);
        self
    }

    /// Append a candidate source. Sources are consulted in insertion order.
    pub fn with_candidates(mut self, source: impl CandidateSource + 'static) -> Self {
        self.candidates.push(Arc::new(source));
        self
    }

    pub fn with_bundled_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bundled_dir = Some(dir.into());
        self
    }

    /// Launch definition for a language, if known.
    pub fn spec(&self, language: &str) -> Option<&LanguageSpec> {
        self.languages.get(&language.to_ascii_lowercase())
    }

    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.languages.keys().map(String::as_str)
    }

    /// Decide where the backend for `language` lives.
    ///
    /// `None` means no location validated; callers treat it as a recoverable
    /// failure.
    pub fn resolve(&self, language: &str) -> Option<ResolvedLocation> {
        let language = language.to_ascii_lowercase();

        if let Some(url) = (self.env)(&remote_url_var(&language)) {
            debug!("Resolved {} to remote override {}", language, url);
            return Some(ResolvedLocation::Remote { url });
        }

        let Some(spec) = self.languages.get(&language) else {
            debug!("No local runtime definition for language {}", language);
            return None;
        };

        let dir_var = runtime_dir_var(&language);
        if let Some(dir) = (self.env)(&dir_var) {
            let dir = PathBuf::from(shellexpand::tilde(&dir).as_ref());
            if let Some(location) = validate(&dir, spec) {
                return Some(location);
            }
            warn!(
                "{} points at {} but {} is missing there; ignoring",
                dir_var,
                dir.display(),
                spec.marker
            );
        }

        for source in &self.candidates {
            for dir in source.candidates(&language) {
                if let Some(location) = validate(&dir, spec) {
                    return Some(location);
                }
            }
        }

        if let Some(bundled) = &self.bundled_dir
            && let Some(location) = validate(&bundled.join(&language), spec)
        {
            return Some(location);
        }

        None
    }
}

/// Accept `dir` if it contains the language's marker file.
fn validate(dir: &Path, spec: &LanguageSpec) -> Option<ResolvedLocation> {
    if !dir.join(&spec.marker).is_file() {
        return None;
    }
    Some(ResolvedLocation::Local {
        package_dir: dir.to_path_buf(),
        entry_point: dir.join(&spec.entry),
    })
}
