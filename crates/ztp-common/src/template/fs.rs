//! Read-only template sources

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::{Error, Result};

/// A read-only tree of template files
///
/// Names are `/`-separated paths. `files(prefix)` returns every regular file
/// under `prefix`, keyed by its path relative to that prefix.
pub trait TemplateFs: Send + Sync {
    /// Contents of every file below `prefix`, keyed by relative name
    fn files(&self, prefix: &str) -> Result<BTreeMap<String, String>>;
}

/// Templates loaded from a directory on disk
#[derive(Debug, Clone)]
pub struct DirFs {
    root: PathBuf,
}

impl DirFs {
    /// Serve templates from `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory the templates are read from
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl TemplateFs for DirFs {
    fn files(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        let base = join_prefix(&self.root, prefix);
        if !base.is_dir() {
            return Err(Error::TemplateNotFound {
                name: base.display().to_string(),
            });
        }

        let mut files = BTreeMap::new();
        for entry in WalkDir::new(&base).follow_links(true) {
            let entry = entry.map_err(|e| {
                Error::internal_with_context("templates", format!("walking {}: {}", base.display(), e))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&base)
                .map_err(|e| Error::internal_with_context("templates", e.to_string()))?;
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let contents = std::fs::read_to_string(entry.path())
                .map_err(|e| Error::template_render(&name, format!("failed to read: {}", e)))?;
            files.insert(name, contents);
        }
        Ok(files)
    }
}

fn join_prefix(root: &Path, prefix: &str) -> PathBuf {
    prefix
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .fold(root.to_path_buf(), |path, part| path.join(part))
}

/// Templates held in memory, mostly for tests and embedded trees
#[derive(Debug, Clone, Default)]
pub struct MemoryFs {
    files: BTreeMap<String, String>,
}

impl MemoryFs {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file at `path`
    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<String>) -> Self {
        self.files.insert(path.into(), contents.into());
        self
    }
}

impl TemplateFs for MemoryFs {
    fn files(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        let prefix = prefix.trim_matches('/');
        let prefix = if prefix == "." { "" } else { prefix };
        Ok(self
            .files
            .iter()
            .filter_map(|(path, contents)| {
                let relative = if prefix.is_empty() {
                    Some(path.as_str())
                } else {
                    path.strip_prefix(prefix)
                        .and_then(|rest| rest.strip_prefix('/'))
                };
                relative.map(|name| (name.to_string(), contents.clone()))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_fs_names_are_relative_to_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let objects = dir.path().join("cluster/objects/nested");
        std::fs::create_dir_all(&objects).unwrap();
        std::fs::write(dir.path().join("cluster/objects/ns.yaml"), "kind: Namespace").unwrap();
        std::fs::write(objects.join("secret.yaml"), "kind: Secret").unwrap();
        std::fs::write(dir.path().join("cluster/other.yaml"), "ignored").unwrap();

        let fs = DirFs::new(dir.path().join("cluster"));
        let files = fs.files("objects").unwrap();
        let names: Vec<_> = files.keys().cloned().collect();
        assert_eq!(names, vec!["nested/secret.yaml", "ns.yaml"]);
        assert_eq!(files["ns.yaml"], "kind: Namespace");
    }

    #[test]
    fn test_dir_fs_missing_prefix_is_template_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = DirFs::new(dir.path()).files("nope").unwrap_err();
        assert!(matches!(err, Error::TemplateNotFound { .. }));
    }

    #[test]
    fn test_memory_fs_prefix_filtering() {
        let fs = MemoryFs::new()
            .with_file("objects/a.yaml", "a")
            .with_file("objects-extra/b.yaml", "b")
            .with_file("scripts/wipe.sh", "c");
        let names: Vec<_> = fs.files("objects").unwrap().into_keys().collect();
        assert_eq!(names, vec!["a.yaml"]);
        assert_eq!(fs.files(".").unwrap().len(), 3);
    }
}
