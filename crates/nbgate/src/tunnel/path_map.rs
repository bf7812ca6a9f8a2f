//! Cloud-root to provider-root path mapping.
//!
//! Learned from the first `runtime-started` reply whose working directory
//! differs from the requested project root. Only one mapping is kept per
//! cloud root; if several provider directories alias the same cloud root,
//! the first one seen wins and later ones are ignored.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathMap {
    roots: BTreeMap<String, String>,
}

fn normalize(path: &str) -> &str {
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

impl PathMap {
    /// Record `cloud_root -> local_root`. Returns whether a new mapping was added.
    pub fn learn(&mut self, cloud_root: &str, local_root: &str) -> bool {
        let cloud = normalize(cloud_root);
        let local = normalize(local_root);
        if cloud == local || cloud == "/" || self.roots.contains_key(cloud) {
            return false;
        }
        self.roots.insert(cloud.to_string(), local.to_string());
        true
    }

    /// Longest cloud root that `path` lives under.
    fn lookup(&self, path: &str) -> Option<(&str, &str)> {
        self.roots
            .iter()
            .filter(|(cloud, _)| {
                path == cloud.as_str()
                    || path
                        .strip_prefix(cloud.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
            .max_by_key(|(cloud, _)| cloud.len())
            .map(|(cloud, local)| (cloud.as_str(), local.as_str()))
    }

    /// Rewrite a filesystem path that starts with a known cloud root.
    pub fn rewrite(&self, path: &str) -> String {
        match self.lookup(path) {
            Some((cloud, local)) => format!("{}{}", local, &path[cloud.len()..]),
            None => path.to_string(),
        }
    }

    /// Rewrite cloud roots embedded anywhere in an identifier, e.g. a session
    /// id of the form `kernel:/cloud/root/doc.qmd`.
    pub fn rewrite_embedded(&self, value: &str) -> String {
        let mut out = value.to_string();
        // Longest roots first so nested roots are not clobbered by their parents.
        let mut roots: Vec<(&String, &String)> = self.roots.iter().collect();
        roots.sort_by_key(|(cloud, _)| std::cmp::Reverse(cloud.len()));
        for (cloud, local) in roots {
            if out.contains(cloud.as_str()) {
                out = out.replace(cloud.as_str(), local);
                break;
            }
        }
        out
    }

    pub fn mappings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.roots.iter().map(|(c, l)| (c.as_str(), l.as_str()))
    }

    pub fn clear(&mut self) {
        self.roots.clear();
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}
