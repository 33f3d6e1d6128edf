//! Object stores holding checkpoint blobs.
//!
//! Keys are `/`-separated relative paths such as `0/parameters.npz`.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Whole-object reads and writes.
pub trait ObjectStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    fn get(&self, key: &str) -> Result<Vec<u8>>;

    fn exists(&self, key: &str) -> bool;
}

/// A directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> PathBuf {
        key.split('/').fold(self.root.clone(), |path, part| path.join(part))
    }
}

impl ObjectStore for LocalStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        // Readers never observe a partially written object.
        let partial = path.with_extension("partial");
        std::fs::write(&partial, bytes).map_err(|e| Error::io(&partial, e))?;
        std::fs::rename(&partial, &path).map_err(|e| Error::io(&path, e))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound(key.to_string())),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    fn exists(&self, key: &str) -> bool {
        self.path(key).is_file()
    }
}

/// In-memory store, shared between threads.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl ObjectStore for MemoryStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| Error::Checkpoint("memory store lock poisoned".to_string()))?;
        objects.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let objects = self
            .objects
            .lock()
            .map_err(|_| Error::Checkpoint("memory store lock poisoned".to_string()))?;
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    fn exists(&self, key: &str) -> bool {
        self.objects
            .lock()
            .map(|objects| objects.contains_key(key))
            .unwrap_or(false)
    }
}

impl<S: ObjectStore + ?Sized> ObjectStore for &S {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        (**self).put(key, bytes)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        (**self).get(key)
    }

    fn exists(&self, key: &str) -> bool {
        (**self).exists(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        assert!(!store.exists("0/parameters.npz"));
        store.put("0/parameters.npz", b"abc").unwrap();
        assert!(store.exists("0/parameters.npz"));
        assert_eq!(store.get("0/parameters.npz").unwrap(), b"abc");
        assert!(matches!(store.get("1/parameters.npz"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        store.put("structure.json", b"{}").unwrap();
        assert_eq!(store.keys(), vec!["structure.json".to_string()]);
        assert_eq!(store.get("structure.json").unwrap(), b"{}");
        assert!(store.get("missing").is_err());
    }
}
