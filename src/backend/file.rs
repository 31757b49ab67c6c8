//! File-backed store.
//!
//! Holds the data in a [`MemoryStore`] and mirrors it to a JSON file. Each
//! mutation is applied to a staged copy, written to disk, and only then
//! committed to memory, so a failed write leaves the store unchanged. The
//! file is a JSON array of `[key, value]` pairs so that insertion order
//! survives a reload. Writes go to a sibling temp file that is then renamed
//! over the target.

use crate::backend::{KeyValueStore, MemoryStore};
use crate::error::{StorageError, StorageResult};
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, trace};

/// A [`KeyValueStore`] persisted to a single JSON file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    data: MemoryStore,
    /// Serializes snapshot writes
    flush_lock: Mutex<()>,
}

impl FileStore {
    /// Opens the store at `path`, loading it if the file exists.
    ///
    /// A missing file is an empty store; the file is created on first write.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();

        let entries: Vec<(String, String)> = match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Vec::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::Corrupt(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(StorageError::Io(e)),
        };

        debug!(path = %path.display(), keys = entries.len(), "Opened file store");

        Ok(Self {
            path,
            data: MemoryStore::from_entries(entries),
            flush_lock: Mutex::new(()),
        })
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies `mutation` to a staged copy, persists it, then to memory.
    fn commit<F>(&self, mutation: F) -> StorageResult<()>
    where
        F: Fn(&MemoryStore) -> StorageResult<()>,
    {
        let _guard = self.flush_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let staged = MemoryStore::from_entries(self.data.entries());
        mutation(&staged)?;
        self.write_snapshot(&staged.entries())?;
        mutation(&self.data)
    }

    fn write_snapshot(&self, entries: &[(String, String)]) -> StorageResult<()> {
        let snapshot = serde_json::to_vec(entries).map_err(io::Error::from)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&snapshot)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        trace!(path = %self.path.display(), bytes = snapshot.len(), "Flushed file store");
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.data.get(key)
    }

    fn set(&self, key: &str, value: String) -> StorageResult<()> {
        self.commit(|store| store.set(key, value.clone()))
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        if self.data.get(key).is_none() {
            return Ok(());
        }
        self.commit(|store| store.remove(key))
    }

    fn clear(&self) -> StorageResult<()> {
        self.commit(|store| store.clear())
    }

    fn keys(&self) -> Vec<String> {
        self.data.keys()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("store.json")).unwrap();

        assert!(store.is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");

        {
            let store = FileStore::open(&path).unwrap();
            store.set("b", r#"{"v":2}"#.into()).unwrap();
            store.set("a", r#"{"v":1}"#.into()).unwrap();
            store.set("gone", "0".into()).unwrap();
            store.remove("gone").unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.keys(), vec!["b", "a"]);
        assert_eq!(store.get("a").as_deref(), Some(r#"{"v":1}"#));
        assert_eq!(store.get("gone"), None);
    }

    #[test]
    fn test_clear_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");

        let store = FileStore::open(&path).unwrap();
        store.set("a", "1".into()).unwrap();
        store.clear().unwrap();

        let reopened = FileStore::open(&path).unwrap();
        assert!(reopened.is_empty());
    }

    #[test]
    fn test_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "{not json").unwrap();

        match FileStore::open(&path) {
            Err(StorageError::Corrupt(msg)) => assert!(msg.contains("store.json")),
            other => panic!("unexpected: {:?}", other.map(|s| s.len())),
        }
    }

    #[test]
    fn test_failed_write_leaves_store_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing-dir").join("store.json");
        let store = FileStore::open(&path).unwrap();

        assert!(matches!(store.set("a", "7".into()), Err(StorageError::Io(_))));
        assert_eq!(store.get("a"), None);
        assert!(store.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_failed_remove_keeps_value() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        let path = sub.join("store.json");

        let store = FileStore::open(&path).unwrap();
        store.set("a", "1".into()).unwrap();
        fs::remove_dir_all(&sub).unwrap();

        assert!(store.remove("a").is_err());
        assert!(store.clear().is_err());
        assert_eq!(store.get("a").as_deref(), Some("1"));
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");

        let store = FileStore::open(&path).unwrap();
        store.set("a", "1".into()).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["store.json"]);
    }
}
