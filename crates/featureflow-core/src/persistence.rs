//! C8 — Retention & Persistence: a whole-value key/value backend
//! (spec §4.7) plus the file-backed implementation, grounded on the
//! teacher's crash-safe `MemoryEventLog::overwrite` (temp file, fsync,
//! atomic rename).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use fs2::FileExt;

/// "A simple key/value interface with whole-value semantics; no range
/// scans or transactions are required" (spec §4.7).
pub trait PersistenceBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// One file per key under a base directory. Writes go to a `.tmp`
/// sibling, `fsync`'d, then renamed over the target — a crash at any
/// point before the rename leaves the previous value intact.
pub struct FilePersistenceBackend {
    base_dir: PathBuf,
}

impl FilePersistenceBackend {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("creating persistence directory {}", base_dir.display()))?;
        Ok(Self { base_dir })
    }

    /// Keys are namespaced by the caller (company/tenant/environment,
    /// per spec §4.7); this just maps a key string to a filesystem-safe
    /// filename so slashes in a namespaced key don't create
    /// unintended subdirectories.
    fn path_for(&self, key: &str) -> PathBuf {
        let filename = key.replace(['/', '\\'], "__");
        self.base_dir.join(filename)
    }

    /// A lock file dedicated to `key`, separate from the data file
    /// itself — unlike locking the data path directly, a lock held on
    /// this fixed name survives the temp-then-rename swap of the data
    /// file underneath it (spec §5: "concurrent reads ... must not
    /// overlap with a write for the same key").
    fn lock_path_for(&self, key: &str) -> PathBuf {
        self.path_for(key).with_extension("lock")
    }

    fn open_lock_file(&self, key: &str) -> Result<fs::File> {
        let lock_path = self.lock_path_for(key);
        fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("opening lock file {}", lock_path.display()))
    }
}

impl PersistenceBackend for FilePersistenceBackend {
    /// Takes a shared advisory lock for `key` for the duration of the
    /// read, so a reader never observes a value mid-write.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let lock_file = self.open_lock_file(key)?;
        lock_file
            .lock_shared()
            .with_context(|| format!("locking {key} for read"))?;
        let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()));
        let _ = FileExt::unlock(&lock_file);
        Ok(Some(bytes?))
    }

    /// Writes through a `.tmp` sibling (crash at any point before the
    /// rename leaves the previous value intact), holding an exclusive
    /// advisory lock for `key` across the rename so a concurrent `get`
    /// never observes a half-renamed file.
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        let tmp_path = path.with_extension("tmp");

        let write_result: Result<()> = (|| {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            use std::io::Write as _;
            file.write_all(value)?;
            file.flush()?;
            file.sync_all()?;
            Ok(())
        })();

        if let Err(err) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(err).with_context(|| format!("writing {}", tmp_path.display()));
        }

        let lock_file = self.open_lock_file(key)?;
        lock_file
            .lock_exclusive()
            .with_context(|| format!("locking {key} for write"))?;
        let rename_result = fs::rename(&tmp_path, &path)
            .with_context(|| format!("renaming {} to {}", tmp_path.display(), path.display()));
        let _ = FileExt::unlock(&lock_file);
        rename_result
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
        }
        Ok(())
    }
}

/// In-process backend for tests.
#[derive(Default)]
pub struct InMemoryPersistenceBackend {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl PersistenceBackend for InMemoryPersistenceBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.values.lock().expect("persistence lock poisoned").get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.values
            .lock()
            .expect("persistence lock poisoned")
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values.lock().expect("persistence lock poisoned").remove(key);
        Ok(())
    }
}

/// Well-known key suffixes persisted under a `(company, tenant,
/// environment)` namespace (spec §6 "Persisted keys").
pub mod keys {
    pub const EVENTS: &str = "events";
    pub const RULES_BODY: &str = "rules_body";
    pub const RULES_HASH: &str = "rules_hash";
    pub const RULES_CACHE_TIMESTAMP: &str = "rules_cache_timestamp";
    /// User- and device-property bags are persisted together as one
    /// `Properties` value (spec §4.7 "whole-value semantics").
    pub const PROPERTIES: &str = "properties";
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_backend_roundtrips_a_value() {
        let dir = tempdir().unwrap();
        let backend = FilePersistenceBackend::new(dir.path()).unwrap();
        backend.put("acme/prod/production/rules_hash", b"abc123").unwrap();
        assert_eq!(
            backend.get("acme/prod/production/rules_hash").unwrap(),
            Some(b"abc123".to_vec())
        );
    }

    #[test]
    fn file_backend_missing_key_is_none() {
        let dir = tempdir().unwrap();
        let backend = FilePersistenceBackend::new(dir.path()).unwrap();
        assert_eq!(backend.get("missing").unwrap(), None);
    }

    #[test]
    fn file_backend_remove_deletes_value() {
        let dir = tempdir().unwrap();
        let backend = FilePersistenceBackend::new(dir.path()).unwrap();
        backend.put("k", b"v").unwrap();
        backend.remove("k").unwrap();
        assert_eq!(backend.get("k").unwrap(), None);
    }

    #[test]
    fn file_backend_overwrite_replaces_value() {
        let dir = tempdir().unwrap();
        let backend = FilePersistenceBackend::new(dir.path()).unwrap();
        backend.put("k", b"first").unwrap();
        backend.put("k", b"second").unwrap();
        assert_eq!(backend.get("k").unwrap(), Some(b"second".to_vec()));
    }

    #[test]
    fn file_backend_write_lock_blocks_concurrent_reader() {
        let dir = tempdir().unwrap();
        let backend = FilePersistenceBackend::new(dir.path()).unwrap();
        backend.put("k", b"first").unwrap();

        // Hold the per-key lock exclusively, as `put` would mid-rename,
        // and confirm a reader attempting the same lock would block
        // rather than silently proceeding unsynchronized.
        let lock_file = backend.open_lock_file("k").unwrap();
        lock_file.lock_exclusive().unwrap();
        assert!(backend.open_lock_file("k").unwrap().try_lock_shared().is_err());
        FileExt::unlock(&lock_file).unwrap();
    }

    #[test]
    fn in_memory_backend_roundtrips() {
        let backend = InMemoryPersistenceBackend::default();
        backend.put("k", b"v").unwrap();
        assert_eq!(backend.get("k").unwrap(), Some(b"v".to_vec()));
        backend.remove("k").unwrap();
        assert_eq!(backend.get("k").unwrap(), None);
    }
}
