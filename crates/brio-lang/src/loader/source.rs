use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;

use dashmap::DashMap;
use indexmap::IndexMap;
use smol_str::SmolStr;

use super::error::SourceError;

/// Where template sources come from.
pub trait SourceProvider {
    /// The template text and its modification time.
    fn read_source(&self, name: &str) -> Result<(String, u64), SourceError>;

    fn resolve_path(&self, name: &str) -> PathBuf;

    /// `None` when the template does not exist.
    fn last_modified(&self, name: &str) -> Option<u64>;

    fn exists(&self, name: &str) -> bool {
        self.last_modified(name).is_some()
    }
}

/// `true` when every recorded dependency still exists with exactly the recorded mtime.
pub fn dependencies_fresh(dependencies: &IndexMap<SmolStr, u64>, sources: &dyn SourceProvider) -> bool {
    dependencies
        .iter()
        .all(|(name, mtime)| sources.last_modified(name) == Some(*mtime))
}

/// Templates in a directory. `layouts.main` resolves to `layouts/main.<extension>`.
#[derive(Debug, Clone)]
pub struct FsSource {
    root: PathBuf,
    extension: String,
}

impl FsSource {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SourceProvider for FsSource {
    fn read_source(&self, name: &str) -> Result<(String, u64), SourceError> {
        read_stamped(&self.resolve_path(name), |p: &Path| fs::read_to_string(p)).map_err(|e| SourceError::io(name, e))
    }

    fn resolve_path(&self, name: &str) -> PathBuf {
        let suffix = format!(".{}", self.extension);
        if name.contains('/') || name.ends_with(&suffix) {
            self.root.join(name)
        } else {
            self.root.join(format!("{}{}", name.replace('.', "/"), suffix))
        }
    }

    fn last_modified(&self, name: &str) -> Option<u64> {
        modified(&self.resolve_path(name)).ok()
    }
}

/// Stats before reading, so a write that lands during the read leaves a stale
/// mtime behind and the next freshness check recompiles.
fn read_stamped(
    path: &Path,
    read: impl FnOnce(&Path) -> std::io::Result<String>,
) -> std::io::Result<(String, u64)> {
    let mtime = modified(path)?;
    let source = read(path)?;
    Ok((source, mtime))
}

fn modified(path: &Path) -> std::io::Result<u64> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default())
}

/// Templates held in memory. Every write moves the template's mtime forward.
#[derive(Debug, Default)]
pub struct MemorySource {
    templates: DashMap<SmolStr, (String, u64)>,
    clock: AtomicU64,
}

impl MemorySource {
    pub fn with(self, name: &str, source: impl Into<String>) -> Self {
        self.insert(name, source);
        self
    }

    pub fn insert(&self, name: &str, source: impl Into<String>) {
        let mtime = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        self.templates.insert(SmolStr::new(name), (source.into(), mtime));
    }

    pub fn remove(&self, name: &str) {
        self.templates.remove(name);
    }
}

impl SourceProvider for MemorySource {
    fn read_source(&self, name: &str) -> Result<(String, u64), SourceError> {
        self.templates
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SourceError::NotFound(SmolStr::new(name)))
    }

    fn resolve_path(&self, name: &str) -> PathBuf {
        PathBuf::from(name)
    }

    fn last_modified(&self, name: &str) -> Option<u64> {
        self.templates.get(name).map(|entry| entry.value().1)
    }
}
