use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::error::CacheError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Another writer holds the lock for this key; nothing was written.
    Contended,
}

/// Persisted compilation artifacts, addressed by cache key.
pub trait ArtifactStore {
    fn exists(&self, key: &str) -> bool;

    /// `Ok(None)` when there is no artifact for `key`.
    fn read_artifact(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Replaces the artifact for `key`. Readers see either the old bytes or the new ones.
    fn write_artifact_atomic(&self, key: &str, bytes: &[u8]) -> Result<WriteOutcome, CacheError>;
}

/// Artifacts stored as files in a cache directory, one `<key>.json` per entry.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    dir: PathBuf,
}

impl FsArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", key))
    }
}

fn write_error(key: &str, error: impl ToString) -> CacheError {
    CacheError::Write {
        key: key.to_string(),
        message: error.to_string(),
    }
}

impl ArtifactStore for FsArtifactStore {
    fn exists(&self, key: &str) -> bool {
        self.artifact_path(key).is_file()
    }

    fn read_artifact(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        match fs::read(self.artifact_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::Read {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }

    fn write_artifact_atomic(&self, key: &str, bytes: &[u8]) -> Result<WriteOutcome, CacheError> {
        fs::create_dir_all(&self.dir).map_err(|e| write_error(key, e))?;

        let lock: File = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path(key))
            .map_err(|e| write_error(key, e))?;
        match lock.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Ok(WriteOutcome::Contended),
            Err(TryLockError::Error(e)) => return Err(write_error(key, e)),
        }

        let mut file = NamedTempFile::new_in(&self.dir).map_err(|e| write_error(key, e))?;
        file.write_all(bytes).map_err(|e| write_error(key, e))?;
        file.as_file().sync_all().map_err(|e| write_error(key, e))?;
        file.persist(self.artifact_path(key))
            .map_err(|e| write_error(key, e.error))?;

        lock.unlock().map_err(|e| write_error(key, e))?;
        Ok(WriteOutcome::Written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path().join("cache"));
        assert!(!store.exists("k"));
        assert_eq!(store.read_artifact("k").unwrap(), None);

        assert_eq!(store.write_artifact_atomic("k", b"one").unwrap(), WriteOutcome::Written);
        assert_eq!(store.write_artifact_atomic("k", b"two").unwrap(), WriteOutcome::Written);
        assert!(store.exists("k"));
        assert_eq!(store.read_artifact("k").unwrap(), Some(b"two".to_vec()));
    }

    #[test]
    fn test_held_lock_is_contended() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let held = File::create(store.lock_path("k")).unwrap();
        held.lock().unwrap();

        assert_eq!(store.write_artifact_atomic("k", b"x").unwrap(), WriteOutcome::Contended);
        assert!(!store.exists("k"));
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        store.write_artifact_atomic("k", b"x").unwrap();

        let mut names = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        names.sort();
        assert_eq!(names, vec!["k.json".to_string(), "k.lock".to_string()]);
    }
}
