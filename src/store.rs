//! Compiled artifact storage
//!
//! Artifacts are keyed by the content hash of the script they were compiled from, so
//! a key is only ever written with one value.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

/// Sub-directory of the cache directory holding artifacts
pub const ARTIFACT_DIR: &str = "sbs";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact {0} not found")]
    NotFound(String),

    #[error("Artifact {0} is not valid UTF-8")]
    InvalidUtf8(String),
}

/// Key-to-text store for compiled scripts
pub trait ArtifactStore: Send + Sync {
    /// Every stored key
    fn list(&self) -> Result<Vec<String>, StoreError>;

    fn read(&self, key: &str) -> Result<String, StoreError>;

    /// Store `contents` under `key`, replacing any previous value
    fn write(&self, key: &str, contents: &str) -> Result<(), StoreError>;
}

/* ===================== Filesystem ===================== */

/// One file per artifact under `<cache_directory>/sbs/`
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Open the store, creating its directory if needed
    pub fn new(cache_directory: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = cache_directory.as_ref().join(ARTIFACT_DIR);
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            action: "create",
            path: root.clone(),
            source,
        })?;
        debug!(path = %root.display(), "Opened artifact store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl ArtifactStore for FsArtifactStore {
    fn list(&self) -> Result<Vec<String>, StoreError> {
        let io_err = |source| StoreError::Io {
            action: "list",
            path: self.root.clone(),
            source,
        };

        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            if !entry.file_type().map_err(io_err)?.is_file() {
                continue;
            }
            // In-flight temp files start with a dot
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn read(&self, key: &str) -> Result<String, StoreError> {
        let path = self.path_for(key);
        let bytes = fs::read(&path).map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(key.to_string()),
            _ => StoreError::Io {
                action: "read",
                path: path.clone(),
                source,
            },
        })?;
        String::from_utf8(bytes).map_err(|_| StoreError::InvalidUtf8(key.to_string()))
    }

    fn write(&self, key: &str, contents: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let io_err = |source| StoreError::Io {
            action: "write",
            path: path.clone(),
            source,
        };

        let mut file = NamedTempFile::new_in(&self.root).map_err(io_err)?;
        file.write_all(contents.as_bytes()).map_err(io_err)?;
        file.persist(&path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

/* ===================== Memory ===================== */

#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    artifacts: RwLock<BTreeMap<String, String>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.artifacts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.read().is_empty()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.artifacts.read().keys().cloned().collect())
    }

    fn read(&self, key: &str) -> Result<String, StoreError> {
        self.artifacts
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn write(&self, key: &str, contents: &str) -> Result<(), StoreError> {
        self.artifacts
            .write()
            .insert(key.to_string(), contents.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path()).unwrap();

        assert_eq!(store.root(), dir.path().join("sbs"));
        assert!(store.list().unwrap().is_empty());

        store.write("abc", "{% set x = 1 %}").unwrap();
        store.write("abc", "{% set x = 1 %}").unwrap();

        assert_eq!(store.list().unwrap(), vec!["abc".to_string()]);
        assert_eq!(store.read("abc").unwrap(), "{% set x = 1 %}");
    }

    #[test]
    fn test_fs_store_reopen_sees_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        FsArtifactStore::new(dir.path())
            .unwrap()
            .write("k", "v")
            .unwrap();

        let reopened = FsArtifactStore::new(dir.path()).unwrap();

        assert_eq!(reopened.list().unwrap(), vec!["k".to_string()]);
    }

    #[test]
    fn test_fs_store_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path()).unwrap();

        assert!(matches!(store.read("nope"), Err(StoreError::NotFound(k)) if k == "nope"));
    }

    #[test]
    fn test_fs_store_rejects_invalid_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path()).unwrap();
        fs::write(store.root().join("bad"), [0xff, 0xfe]).unwrap();

        assert!(matches!(store.read("bad"), Err(StoreError::InvalidUtf8(_))));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryArtifactStore::new();
        assert!(store.is_empty());

        store.write("b", "2").unwrap();
        store.write("a", "1").unwrap();

        assert_eq!(store.list().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(store.read("a").unwrap(), "1");
        assert_eq!(store.len(), 2);
        assert!(matches!(store.read("c"), Err(StoreError::NotFound(_))));
    }
}
