use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::error::StoreResult;
use crate::traits::DataStorage;

type Bucket = HashMap<String, Vec<u8>>;

/// In-memory, HashMap-based record store.
///
/// Intended for tests and single-process servers. Buckets are created on
/// first save. Listeners are supported.
pub struct InMemoryStorage {
    buckets: RwLock<HashMap<String, Bucket>>,
    saves: AtomicU64,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            saves: AtomicU64::new(0),
        }
    }

    /// Number of records across all buckets.
    pub fn len(&self) -> usize {
        self.buckets
            .read()
            .expect("lock poisoned")
            .values()
            .map(HashMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of `save` calls served.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.buckets.write().expect("lock poisoned").clear();
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl DataStorage for InMemoryStorage {
    fn load(&self, bucket: &str, id: &str) -> StoreResult<Option<Vec<u8>>> {
        let map = self.buckets.read().expect("lock poisoned");
        Ok(map.get(bucket).and_then(|b| b.get(id)).cloned())
    }

    fn save(&self, bucket: &str, id: &str, data: &[u8]) -> StoreResult<()> {
        let mut map = self.buckets.write().expect("lock poisoned");
        map.entry(bucket.to_string())
            .or_default()
            .insert(id.to_string(), data.to_vec());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn list_ids(&self, bucket: &str) -> StoreResult<Vec<String>> {
        let map = self.buckets.read().expect("lock poisoned");
        Ok(map
            .get(bucket)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn delete(&self, bucket: &str, id: &str) -> StoreResult<bool> {
        let mut map = self.buckets.write().expect("lock poisoned");
        Ok(map.get_mut(bucket).and_then(|b| b.remove(id)).is_some())
    }

    fn exists(&self, bucket: &str, id: &str) -> StoreResult<bool> {
        let map = self.buckets.read().expect("lock poisoned");
        Ok(map.get(bucket).is_some_and(|b| b.contains_key(id)))
    }

    fn supports_listeners(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

impl std::fmt::Debug for InMemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStorage")
            .field("record_count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load() {
        let store = InMemoryStorage::new();
        store.save("players", "a", b"hello").unwrap();
        assert_eq!(store.load("players", "a").unwrap().as_deref(), Some(&b"hello"[..]));
        assert_eq!(store.load("players", "b").unwrap(), None);
        assert_eq!(store.load("guilds", "a").unwrap(), None);
    }

    #[test]
    fn save_replaces_record() {
        let store = InMemoryStorage::new();
        store.save("players", "a", b"one").unwrap();
        store.save("players", "a", b"two").unwrap();
        assert_eq!(store.load("players", "a").unwrap().unwrap(), b"two");
        assert_eq!(store.len(), 1);
        assert_eq!(store.save_count(), 2);
    }

    #[test]
    fn buckets_are_isolated() {
        let store = InMemoryStorage::new();
        store.save("players", "x", b"p").unwrap();
        store.save("linked/island", "x", b"i").unwrap();
        assert_eq!(store.list_ids("players").unwrap(), vec!["x".to_string()]);
        assert_eq!(store.load("linked/island", "x").unwrap().unwrap(), b"i");
    }

    #[test]
    fn delete_reports_existence() {
        let store = InMemoryStorage::new();
        store.save("players", "a", b"x").unwrap();
        assert!(store.exists("players", "a").unwrap());
        assert!(store.delete("players", "a").unwrap());
        assert!(!store.delete("players", "a").unwrap());
        assert!(!store.exists("players", "a").unwrap());
    }

    #[test]
    fn list_unknown_bucket_is_empty() {
        let store = InMemoryStorage::new();
        assert!(store.list_ids("nothing").unwrap().is_empty());
    }

    #[test]
    fn memory_supports_listeners() {
        assert!(InMemoryStorage::new().supports_listeners());
    }

    #[test]
    fn concurrent_saves() {
        use std::sync::Arc;
        let store = Arc::new(InMemoryStorage::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        store.save("players", &format!("{t}-{i}"), b"v").unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len(), 400);
    }
}
