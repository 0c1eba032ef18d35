use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::traits::DataStorage;

/// Default record file extension.
pub const DEFAULT_EXTENSION: &str = ".dat";

/// One file per record at `root/<bucket>/<id><extension>`.
///
/// Writes go to a temporary file in the same directory and are renamed into
/// place, so readers never observe a half-written record. Listeners are not
/// supported: other processes writing the same directory are invisible.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
    extension: String,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_extension(root, DEFAULT_EXTENSION)
    }

    pub fn with_extension(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    fn bucket_dir(&self, bucket: &str) -> StoreResult<PathBuf> {
        let mut dir = self.root.clone();
        for segment in bucket.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
                return Err(StoreError::InvalidId {
                    bucket: bucket.to_string(),
                    id: String::new(),
                    reason: "bad bucket segment",
                });
            }
            dir.push(segment);
        }
        Ok(dir)
    }

    fn record_path(&self, bucket: &str, id: &str) -> StoreResult<PathBuf> {
        if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
            return Err(StoreError::InvalidId {
                bucket: bucket.to_string(),
                id: id.to_string(),
                reason: "ids must be a single path segment",
            });
        }
        Ok(self.bucket_dir(bucket)?.join(format!("{id}{}", self.extension)))
    }
}

impl DataStorage for FileStorage {
    fn load(&self, bucket: &str, id: &str) -> StoreResult<Option<Vec<u8>>> {
        let path = self.record_path(bucket, id)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, bucket: &str, id: &str, data: &[u8]) -> StoreResult<()> {
        let path = self.record_path(bucket, id)?;
        let dir = self.bucket_dir(bucket)?;
        fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;

        debug!(path = %path.display(), bytes = data.len(), "record saved");
        Ok(())
    }

    fn list_ids(&self, bucket: &str) -> StoreResult<Vec<String>> {
        let dir = self.bucket_dir(bucket)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_suffix(self.extension.as_str()) {
                if !id.is_empty() {
                    ids.push(id.to_string());
                }
            }
        }
        Ok(ids)
    }

    fn delete(&self, bucket: &str, id: &str) -> StoreResult<bool> {
        let path = self.record_path(bucket, id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, bucket: &str, id: &str) -> StoreResult<bool> {
        Ok(self.record_path(bucket, id)?.is_file())
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, FileStorage) {
        let dir = TempDir::new().unwrap();
        let store = FileStorage::new(dir.path());
        (dir, store)
    }

    #[test]
    fn save_and_load() {
        let (dir, store) = store();
        store.save("players", "abc", b"{}").unwrap();
        assert!(dir.path().join("players").join("abc.dat").is_file());
        assert_eq!(store.load("players", "abc").unwrap().unwrap(), b"{}");
    }

    #[test]
    fn missing_record_is_none() {
        let (_dir, store) = store();
        assert_eq!(store.load("players", "nobody").unwrap(), None);
        assert!(!store.exists("players", "nobody").unwrap());
    }

    #[test]
    fn nested_buckets_map_to_directories() {
        let (dir, store) = store();
        store.save("linked/island", "k1", b"x").unwrap();
        assert!(dir.path().join("linked").join("island").join("k1.dat").is_file());
        assert_eq!(store.list_ids("linked/island").unwrap(), vec!["k1".to_string()]);
    }

    #[test]
    fn list_ignores_foreign_files() {
        let (dir, store) = store();
        store.save("players", "a", b"1").unwrap();
        store.save("players", "b", b"2").unwrap();
        fs::write(dir.path().join("players").join("notes.txt"), b"hi").unwrap();
        let mut ids = store.list_ids("players").unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert!(store.list_ids("empty").unwrap().is_empty());
    }

    #[test]
    fn overwrite_and_delete() {
        let (_dir, store) = store();
        store.save("players", "a", b"old").unwrap();
        store.save("players", "a", b"new").unwrap();
        assert_eq!(store.load("players", "a").unwrap().unwrap(), b"new");
        assert!(store.delete("players", "a").unwrap());
        assert!(!store.delete("players", "a").unwrap());
    }

    #[test]
    fn custom_extension() {
        let dir = TempDir::new().unwrap();
        let store = FileStorage::with_extension(dir.path(), ".json");
        store.save("players", "a", b"{}").unwrap();
        assert!(dir.path().join("players/a.json").is_file());
    }

    #[test]
    fn rejects_path_escapes() {
        let (_dir, store) = store();
        assert!(matches!(
            store.save("players", "../evil", b"x"),
            Err(StoreError::InvalidId { .. })
        ));
        assert!(store.load("../players", "a").is_err());
        assert!(store.load("players", "").is_err());
    }

    #[test]
    fn file_storage_has_no_listeners() {
        let (_dir, store) = store();
        assert!(!store.supports_listeners());
        assert_eq!(store.backend_name(), "file");
    }
}
