use std::sync::Arc;

use crate::error::StoreResult;

/// Durable record store addressed by `(bucket, id)`.
///
/// Buckets may be nested with `/` (`linked/island`); ids are flat.
pub trait DataStorage: Send + Sync {
    /// Load a record. Returns `Ok(None)` if it does not exist.
    fn load(&self, bucket: &str, id: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Create or replace a record.
    fn save(&self, bucket: &str, id: &str, data: &[u8]) -> StoreResult<()>;

    /// All record ids in a bucket, in no particular order.
    fn list_ids(&self, bucket: &str) -> StoreResult<Vec<String>>;

    /// Delete a record. Returns `true` if it existed.
    fn delete(&self, bucket: &str, id: &str) -> StoreResult<bool>;

    fn exists(&self, bucket: &str, id: &str) -> StoreResult<bool> {
        Ok(self.load(bucket, id)?.is_some())
    }

    /// Whether change listeners may be registered against data in this
    /// backend. Local-only durable backends return `false`.
    fn supports_listeners(&self) -> bool {
        false
    }

    /// Short name for logs and error messages.
    fn backend_name(&self) -> &'static str;
}

impl<S: DataStorage + ?Sized> DataStorage for Arc<S> {
    fn load(&self, bucket: &str, id: &str) -> StoreResult<Option<Vec<u8>>> {
        (**self).load(bucket, id)
    }

    fn save(&self, bucket: &str, id: &str, data: &[u8]) -> StoreResult<()> {
        (**self).save(bucket, id, data)
    }

    fn list_ids(&self, bucket: &str) -> StoreResult<Vec<String>> {
        (**self).list_ids(bucket)
    }

    fn delete(&self, bucket: &str, id: &str) -> StoreResult<bool> {
        (**self).delete(bucket, id)
    }

    fn exists(&self, bucket: &str, id: &str) -> StoreResult<bool> {
        (**self).exists(bucket, id)
    }

    fn supports_listeners(&self) -> bool {
        (**self).supports_listeners()
    }

    fn backend_name(&self) -> &'static str {
        (**self).backend_name()
    }
}
