use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, warn};

use tally_codec::{DataFormat, Record};
use tally_store::DataStorage;
use tally_types::{FieldSpec, FieldValue};

use crate::container::EntityContainer;
use crate::error::DataResult;
use crate::expiry::ExpirationTracker;
use crate::key::{BucketLayout, EntityKey};

/// Lock and cache of one entity.
struct EntitySlot {
    lock: ReentrantMutex<()>,
    container: Mutex<EntityContainer>,
    hydrated: AtomicBool,
}

impl EntitySlot {
    fn new(format: DataFormat) -> Self {
        Self {
            lock: ReentrantMutex::new(()),
            container: Mutex::new(EntityContainer::new(format)),
            hydrated: AtomicBool::new(false),
        }
    }
}

/// Access to one resident entity.
///
/// [`EntityStore::with_lock`] hands these out with the entity lock held.
/// [`Pinned::access`] hands them out without it, in which case each
/// primitive is only atomic on its own, through the container mutex.
pub struct Held<'a, K> {
    key: &'a K,
    slot: &'a EntitySlot,
}

impl<K> Held<'_, K> {
    pub fn key(&self) -> &K {
        self.key
    }
}

/// An entity's slot kept resident without taking its lock. Eviction skips
/// pinned entities, so a value staged through one is still there when the
/// entity is persisted.
pub struct Pinned<K> {
    key: K,
    slot: Arc<EntitySlot>,
}

impl<K> Pinned<K> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn access(&self) -> Held<'_, K> {
        Held {
            key: &self.key,
            slot: &self.slot,
        }
    }
}

/// Per-entity lock, lazy cache and full-record write-through for one kind
/// of entity.
pub struct EntityStore<K: EntityKey> {
    storage: Arc<dyn DataStorage>,
    format: DataFormat,
    layout: BucketLayout,
    expiry: Arc<ExpirationTracker>,
    entities: DashMap<K, Arc<EntitySlot>>,
}

impl<K: EntityKey> EntityStore<K> {
    pub fn new(
        storage: Arc<dyn DataStorage>,
        format: DataFormat,
        layout: BucketLayout,
        expiry: Arc<ExpirationTracker>,
    ) -> Self {
        Self {
            storage,
            format,
            layout,
            expiry,
            entities: DashMap::new(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn DataStorage> {
        &self.storage
    }

    pub fn format(&self) -> DataFormat {
        self.format
    }

    pub fn layout(&self) -> &BucketLayout {
        &self.layout
    }

    fn slot(&self, key: &K) -> Arc<EntitySlot> {
        if let Some(slot) = self.entities.get(key) {
            return slot.clone();
        }
        self.entities
            .entry(key.clone())
            .or_insert_with(|| Arc::new(EntitySlot::new(self.format)))
            .clone()
    }

    /// Run `body` holding the entity's lock. Re-entrant on the same thread.
    pub fn with_lock<R>(&self, key: &K, body: impl FnOnce(&Held<'_, K>) -> R) -> R {
        let slot = self.slot(key);
        let _guard = slot.lock.lock();
        body(&Held { key, slot: &slot })
    }

    // ---- field operations ----

    pub fn get<T: FieldValue>(&self, key: &K, spec: &FieldSpec<T>) -> DataResult<T> {
        self.with_lock(key, |held| self.read(held, spec))
    }

    /// Validate, replace, persist the whole record and then call `notify`
    /// with `(old, new)`, all under the entity's lock. Returns the old value.
    ///
    /// `ttl` overrides the field's default TTL; a field with neither gets no
    /// deadline.
    pub fn set<T: FieldValue>(
        &self,
        key: &K,
        spec: &FieldSpec<T>,
        value: T,
        ttl: Option<Duration>,
        notify: impl FnOnce(&T, &T) -> DataResult<()>,
    ) -> DataResult<T> {
        spec.validate(&value)?;
        self.with_lock(key, |held| {
            let old = self.write(held, spec, value.clone())?;
            self.arm(held, spec, ttl);
            notify(&old, &value)?;
            Ok(old)
        })
    }

    /// Read, transform, validate and write as one unit. `f` runs exactly
    /// once. Returns the new value.
    pub fn update<T: FieldValue>(
        &self,
        key: &K,
        spec: &FieldSpec<T>,
        f: impl FnOnce(T) -> T,
        ttl: Option<Duration>,
        notify: impl FnOnce(&T, &T) -> DataResult<()>,
    ) -> DataResult<T> {
        self.with_lock(key, |held| {
            let current = self.read(held, spec)?;
            let new = f(current);
            spec.validate(&new)?;
            let old = self.write(held, spec, new.clone())?;
            self.arm(held, spec, ttl);
            notify(&old, &new)?;
            Ok(new)
        })
    }

    fn arm<T: FieldValue>(&self, held: &Held<'_, K>, spec: &FieldSpec<T>, ttl: Option<Duration>) {
        if let Some(ttl) = ttl.or(spec.ttl()) {
            self.expiry
                .set_expiration(&held.key.expiry_scope(), spec.full_key(), ttl);
        }
    }

    // ---- lock-holding primitives ----

    /// Current value. Expired fields read as their default without touching
    /// storage.
    pub fn read<T: FieldValue>(&self, held: &Held<'_, K>, spec: &FieldSpec<T>) -> DataResult<T> {
        if self.lapsed(held.key, spec) {
            return Ok(spec.default_value());
        }
        self.resolve(held.key, held.slot, spec)
    }

    /// Cached or stored value, ignoring expiration.
    pub fn read_raw<T: FieldValue>(
        &self,
        held: &Held<'_, K>,
        spec: &FieldSpec<T>,
    ) -> DataResult<T> {
        self.resolve(held.key, held.slot, spec)
    }

    /// Replace the value in the cache only.
    pub fn stage<T: FieldValue>(
        &self,
        held: &Held<'_, K>,
        spec: &FieldSpec<T>,
        value: T,
    ) -> DataResult<()> {
        self.stage_slot(held.key, held.slot, spec, value)
    }

    /// Put a previously read value back into the cache.
    pub fn restore<T: FieldValue>(
        &self,
        held: &Held<'_, K>,
        spec: &FieldSpec<T>,
        original: T,
    ) -> DataResult<()> {
        debug!(entity = %held.key, field = spec.full_key(), "restoring cached value");
        self.stage_slot(held.key, held.slot, spec, original)
    }

    /// Write the whole container to storage.
    pub fn persist(&self, held: &Held<'_, K>) -> DataResult<()> {
        self.persist_slot(held.key, held.slot)
    }

    /// Stage and persist, returning the old value. If persisting fails the
    /// old value is put back.
    pub fn write<T: FieldValue>(
        &self,
        held: &Held<'_, K>,
        spec: &FieldSpec<T>,
        value: T,
    ) -> DataResult<T> {
        let old = self.read(held, spec)?;
        self.stage(held, spec, value)?;
        if let Err(err) = self.persist(held) {
            self.stage(held, spec, old)?;
            return Err(err);
        }
        Ok(old)
    }

    /// Keep the entity resident for access without its lock.
    pub fn pin(&self, key: &K) -> Pinned<K> {
        Pinned {
            key: key.clone(),
            slot: self.slot(key),
        }
    }

    // ---- cache management ----

    /// Drop cached entities nobody currently references. A slot whose lock is
    /// held or awaited has an outstanding reference and is kept.
    pub fn evict_idle(&self) -> usize {
        let before = self.entities.len();
        self.entities.retain(|_, slot| Arc::strong_count(slot) > 1);
        let evicted = before.saturating_sub(self.entities.len());
        if evicted > 0 {
            debug!(evicted, "evicted idle entities");
        }
        evicted
    }

    /// Number of entities currently cached.
    pub fn resident(&self) -> usize {
        self.entities.len()
    }

    // ---- internals ----

    fn lapsed<T: FieldValue>(&self, key: &K, spec: &FieldSpec<T>) -> bool {
        spec.ttl().is_some() && self.expiry.is_expired(&key.expiry_scope(), spec.full_key())
    }

    fn resolve<T: FieldValue>(
        &self,
        key: &K,
        slot: &EntitySlot,
        spec: &FieldSpec<T>,
    ) -> DataResult<T> {
        if let Some(value) = slot.container.lock().cached(spec)? {
            return Ok(value);
        }
        let record = self.load_record(key)?;
        let mut container = slot.container.lock();
        container.absorb(record);
        slot.hydrated.store(true, Ordering::Release);
        container.resolve(spec)
    }

    fn stage_slot<T: FieldValue>(
        &self,
        key: &K,
        slot: &EntitySlot,
        spec: &FieldSpec<T>,
        value: T,
    ) -> DataResult<()> {
        self.hydrate(key, slot)?;
        slot.container.lock().put(spec, value)
    }

    fn persist_slot(&self, key: &K, slot: &EntitySlot) -> DataResult<()> {
        self.hydrate(key, slot)?;
        let bytes = slot.container.lock().encode()?;
        let bucket = key.bucket(&self.layout);
        self.storage.save(&bucket, &key.record_id(), &bytes)?;
        debug!(entity = %key, bucket = %bucket, bytes = bytes.len(), "persisted entity");
        Ok(())
    }

    // Any write must see the stored record first, or a full-container save
    // would drop fields this process never read.
    fn hydrate(&self, key: &K, slot: &EntitySlot) -> DataResult<()> {
        if slot.hydrated.load(Ordering::Acquire) {
            return Ok(());
        }
        let record = self.load_record(key)?;
        slot.container.lock().absorb(record);
        slot.hydrated.store(true, Ordering::Release);
        Ok(())
    }

    fn load_record(&self, key: &K) -> DataResult<Record> {
        let bucket = key.bucket(&self.layout);
        let Some(bytes) = self.storage.load(&bucket, &key.record_id())? else {
            debug!(entity = %key, bucket = %bucket, "no stored record");
            return Ok(Record::new());
        };
        match self.format.decode_record(&bytes) {
            Ok(record) => {
                debug!(entity = %key, fields = record.len(), "loaded entity record");
                Ok(record)
            }
            Err(err) => {
                warn!(entity = %key, error = %err, "stored record is unreadable");
                Err(err.into())
            }
        }
    }
}

impl<K: EntityKey> std::fmt::Debug for EntityStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("backend", &self.storage.backend_name())
            .field("format", &self.format)
            .field("resident", &self.entities.len())
            .finish()
    }
}
