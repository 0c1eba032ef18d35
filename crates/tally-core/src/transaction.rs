use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, warn};

use tally_types::{FieldValue, LinkKey, LinkedField, OwnerField, OwnerId};

use crate::engine::Engine;
use crate::error::{DataError, DataResult, TxError};
use crate::expiry::ExpirationTracker;
use crate::key::{ExpiryScope, SharedKey};
use crate::store::{EntityStore, Held, Pinned};

enum Scope<'t> {
    /// Normal transaction: the owner's lock is held.
    Owner(&'t Held<'t, OwnerId>),
    /// Direct transaction on one shared entity: that entity's lock is held.
    Direct {
        link: Arc<str>,
        key: Arc<dyn Any + Send + Sync>,
        held: &'t Held<'t, SharedKey>,
    },
}

// ---- journal entries ----

trait OwnerJournal {
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn stage(&mut self, store: &EntityStore<OwnerId>, held: &Held<'_, OwnerId>)
        -> DataResult<bool>;
    fn restore(&self, store: &EntityStore<OwnerId>, held: &Held<'_, OwnerId>) -> DataResult<()>;
    fn arm(&self, expiry: &ExpirationTracker, owner: OwnerId);
    fn notify(&self, engine: &Engine, owner: OwnerId) -> DataResult<()>;
}

struct OwnerEntry<T> {
    field: OwnerField<T>,
    original: T,
    pending: Option<T>,
    staged: bool,
}

impl<T: FieldValue> OwnerEntry<T> {
    fn current(&self) -> T {
        self.pending.clone().unwrap_or_else(|| self.original.clone())
    }
}

impl<T: FieldValue> OwnerJournal for OwnerEntry<T> {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn stage(
        &mut self,
        store: &EntityStore<OwnerId>,
        held: &Held<'_, OwnerId>,
    ) -> DataResult<bool> {
        let Some(pending) = &self.pending else {
            return Ok(false);
        };
        store.stage(held, &self.field, pending.clone())?;
        self.staged = true;
        Ok(true)
    }

    fn restore(&self, store: &EntityStore<OwnerId>, held: &Held<'_, OwnerId>) -> DataResult<()> {
        if self.staged {
            store.restore(held, &self.field, self.original.clone())?;
        }
        Ok(())
    }

    fn arm(&self, expiry: &ExpirationTracker, owner: OwnerId) {
        if let (Some(_), Some(ttl)) = (&self.pending, self.field.ttl()) {
            expiry.set_expiration(&ExpiryScope::Owner(owner), self.field.full_key(), ttl);
        }
    }

    fn notify(&self, engine: &Engine, owner: OwnerId) -> DataResult<()> {
        match &self.pending {
            Some(pending) => engine.notify_owner(&self.field, owner, &self.original, pending),
            None => Ok(()),
        }
    }
}

trait SharedJournal {
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn stage(&mut self, store: &EntityStore<SharedKey>) -> DataResult<bool>;
    fn restore(&self, store: &EntityStore<SharedKey>) -> DataResult<()>;
    fn arm(&self, expiry: &ExpirationTracker);
    fn notify(&self, engine: &Engine) -> DataResult<()>;
}

// Shared entries pin their entity, so nothing staged is evicted before the
// commit persists it.
struct SharedEntry<K, T> {
    field: LinkedField<K, T>,
    key: K,
    pin: Pinned<SharedKey>,
    original: T,
    pending: Option<T>,
    staged: bool,
}

impl<K: LinkKey, T: FieldValue> SharedEntry<K, T> {
    fn current(&self) -> T {
        self.pending.clone().unwrap_or_else(|| self.original.clone())
    }
}

impl<K: LinkKey, T: FieldValue> SharedJournal for SharedEntry<K, T> {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn stage(&mut self, store: &EntityStore<SharedKey>) -> DataResult<bool> {
        let Some(pending) = self.pending.clone() else {
            return Ok(false);
        };
        store.stage(&self.pin.access(), &self.field, pending)?;
        self.staged = true;
        Ok(true)
    }

    fn restore(&self, store: &EntityStore<SharedKey>) -> DataResult<()> {
        if self.staged {
            store.restore(&self.pin.access(), &self.field, self.original.clone())?;
        }
        Ok(())
    }

    fn arm(&self, expiry: &ExpirationTracker) {
        if let (Some(_), Some(ttl)) = (&self.pending, self.field.ttl()) {
            expiry.set_expiration(
                &ExpiryScope::Shared(self.pin.key().clone()),
                self.field.full_key(),
                ttl,
            );
        }
    }

    fn notify(&self, engine: &Engine) -> DataResult<()> {
        match &self.pending {
            Some(pending) => engine.notify_shared(
                &self.field,
                &self.key,
                self.pin.key(),
                &self.original,
                pending,
            ),
            None => Ok(()),
        }
    }
}

fn type_mismatch(field: &str) -> DataError {
    DataError::TypeMismatch {
        field: field.to_string(),
    }
}

/// A journal of reads and pending writes on one entity, applied together
/// when the body returns `Ok`.
///
/// Obtained through [`Engine::transaction`] (owner scope) or
/// [`Engine::transaction_direct`] (one shared entity). Reads see this
/// transaction's own pending writes. Nothing reaches the cache, storage or
/// listeners until commit; listeners then receive one event per written
/// field carrying the value before the transaction and the final value.
///
/// In owner scope, linked fields are resolved through the link registry at
/// access time and their shared containers are touched without taking the
/// shared entity's lock.
///
/// Commit persists shared entities before the owner. If any save fails,
/// cached values are restored and entities already saved are saved again
/// with their original values.
pub struct Transaction<'t> {
    engine: &'t Engine,
    scope: Scope<'t>,
    owner_entries: BTreeMap<Arc<str>, Box<dyn OwnerJournal>>,
    shared_entries: BTreeMap<(SharedKey, Arc<str>), Box<dyn SharedJournal>>,
    persisted: BTreeSet<SharedKey>,
    aborted: bool,
}

impl<'t> Transaction<'t> {
    pub(crate) fn for_owner(engine: &'t Engine, held: &'t Held<'t, OwnerId>) -> Self {
        Self::with_scope(engine, Scope::Owner(held))
    }

    pub(crate) fn direct(
        engine: &'t Engine,
        link: Arc<str>,
        key: Arc<dyn Any + Send + Sync>,
        held: &'t Held<'t, SharedKey>,
    ) -> Self {
        Self::with_scope(engine, Scope::Direct { link, key, held })
    }

    fn with_scope(engine: &'t Engine, scope: Scope<'t>) -> Self {
        Self {
            engine,
            scope,
            owner_entries: BTreeMap::new(),
            shared_entries: BTreeMap::new(),
            persisted: BTreeSet::new(),
            aborted: false,
        }
    }

    /// The owner this transaction is scoped to, if any.
    pub fn owner(&self) -> Option<OwnerId> {
        match self.scope {
            Scope::Owner(held) => Some(*held.key()),
            Scope::Direct { .. } => None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Roll back. Return the result from the body:
    ///
    /// ```ignore
    /// engine.transaction(owner, |tx| {
    ///     if tx.get(&COINS)? < 100 {
    ///         return tx.abort();
    ///     }
    ///     tx.update(&COINS, |c| c - 100)?;
    ///     Ok(())
    /// })?;
    /// ```
    pub fn abort<R>(&mut self) -> Result<R, TxError> {
        self.aborted = true;
        Err(TxError::Aborted)
    }

    // ---- owner fields ----

    pub fn get<T: FieldValue>(&mut self, field: &OwnerField<T>) -> DataResult<T> {
        Ok(self.owner_entry(field)?.current())
    }

    pub fn set<T: FieldValue>(&mut self, field: &OwnerField<T>, value: T) -> DataResult<()> {
        self.ensure_active()?;
        field.validate(&value)?;
        self.owner_entry(field)?.pending = Some(value);
        Ok(())
    }

    pub fn update<T: FieldValue>(
        &mut self,
        field: &OwnerField<T>,
        f: impl FnOnce(T) -> T,
    ) -> DataResult<T> {
        let new = f(self.get(field)?);
        self.set(field, new.clone())?;
        Ok(new)
    }

    // ---- linked fields ----

    /// The linked value, or the field's default if the owner is not linked.
    pub fn get_linked<K: LinkKey, T: FieldValue>(
        &mut self,
        field: &LinkedField<K, T>,
    ) -> DataResult<T> {
        self.ensure_active()?;
        match self.linked_target(field)? {
            Some((key, shared)) => Ok(self.shared_entry(field, key, shared)?.current()),
            None => Ok(field.default_value()),
        }
    }

    pub fn set_linked<K: LinkKey, T: FieldValue>(
        &mut self,
        field: &LinkedField<K, T>,
        value: T,
    ) -> DataResult<()> {
        self.ensure_active()?;
        field.validate(&value)?;
        let (key, shared) = self.require_target(field)?;
        self.shared_entry(field, key, shared)?.pending = Some(value);
        Ok(())
    }

    pub fn update_linked<K: LinkKey, T: FieldValue>(
        &mut self,
        field: &LinkedField<K, T>,
        f: impl FnOnce(T) -> T,
    ) -> DataResult<T> {
        self.ensure_active()?;
        let (key, shared) = self.require_target(field)?;
        let entry = self.shared_entry(field, key, shared)?;
        let new = f(entry.current());
        field.validate(&new)?;
        entry.pending = Some(new.clone());
        Ok(new)
    }

    // ---- internals ----

    fn ensure_active(&self) -> DataResult<()> {
        if self.aborted {
            return Err(DataError::TransactionClosed);
        }
        Ok(())
    }

    fn owner_entry<T: FieldValue>(&mut self, field: &OwnerField<T>) -> DataResult<&mut OwnerEntry<T>> {
        self.ensure_active()?;
        let held = match self.scope {
            Scope::Owner(held) => held,
            Scope::Direct { .. } => {
                return Err(DataError::NoOwnerScope {
                    field: field.full_key().to_string(),
                })
            }
        };
        if !self.owner_entries.contains_key(field.full_key()) {
            let original = self.engine.owners().read(held, field)?;
            self.owner_entries.insert(
                field.full_key_arc(),
                Box::new(OwnerEntry {
                    field: field.clone(),
                    original,
                    pending: None,
                    staged: false,
                }),
            );
        }
        self.owner_entries
            .get_mut(field.full_key())
            .and_then(|entry| entry.as_any_mut().downcast_mut::<OwnerEntry<T>>())
            .ok_or_else(|| type_mismatch(field.full_key()))
    }

    fn linked_target<K: LinkKey, T: FieldValue>(
        &self,
        field: &LinkedField<K, T>,
    ) -> DataResult<Option<(K, SharedKey)>> {
        let link = field.link_type();
        let key = match &self.scope {
            Scope::Owner(held) => self.engine.links().resolve(*held.key(), link),
            Scope::Direct { link: scoped, key, .. } => {
                let mismatch = || DataError::LinkTypeMismatch {
                    expected: scoped.to_string(),
                    actual: link.name().to_string(),
                };
                if &**scoped != link.name() {
                    return Err(mismatch());
                }
                Some(key.downcast_ref::<K>().cloned().ok_or_else(mismatch)?)
            }
        };
        Ok(key.map(|key| {
            let shared = SharedKey::of(link, &key);
            (key, shared)
        }))
    }

    fn require_target<K: LinkKey, T: FieldValue>(
        &self,
        field: &LinkedField<K, T>,
    ) -> DataResult<(K, SharedKey)> {
        self.linked_target(field)?.ok_or_else(|| DataError::NotLinked {
            owner: self.owner().unwrap_or_default(),
            link_type: field.link_type().name().to_string(),
        })
    }

    fn shared_entry<K: LinkKey, T: FieldValue>(
        &mut self,
        field: &LinkedField<K, T>,
        key: K,
        shared: SharedKey,
    ) -> DataResult<&mut SharedEntry<K, T>> {
        let slot = (shared.clone(), field.full_key_arc());
        if !self.shared_entries.contains_key(&slot) {
            let store = self.engine.shared_store();
            let pin = store.pin(&shared);
            let original = match &self.scope {
                Scope::Direct { held, .. } => store.read(held, field)?,
                Scope::Owner(_) => store.read(&pin.access(), field)?,
            };
            self.shared_entries.insert(
                slot.clone(),
                Box::new(SharedEntry {
                    field: field.clone(),
                    key,
                    pin,
                    original,
                    pending: None,
                    staged: false,
                }),
            );
        }
        self.shared_entries
            .get_mut(&slot)
            .and_then(|entry| entry.as_any_mut().downcast_mut::<SharedEntry<K, T>>())
            .ok_or_else(|| type_mismatch(field.full_key()))
    }

    /// Apply the outcome of the body: commit on `Ok`, roll back otherwise.
    /// An abort anywhere in the body wins over what it returned.
    pub(crate) fn conclude<R>(mut self, outcome: Result<R, TxError>) -> DataResult<Option<R>> {
        let value = match outcome {
            Ok(value) if !self.aborted => value,
            Err(TxError::Failed(err)) if !self.aborted => {
                self.rollback();
                return Err(err);
            }
            _ => {
                self.rollback();
                debug!(owner = ?self.owner(), "transaction aborted");
                return Ok(None);
            }
        };
        if let Err(err) = self.write_through() {
            self.rollback();
            return Err(err);
        }
        self.publish()?;
        debug!(
            owner = ?self.owner(),
            owner_fields = self.owner_entries.len(),
            shared_fields = self.shared_entries.len(),
            "transaction committed"
        );
        Ok(Some(value))
    }

    // Stage every pending write, then persist each touched entity once:
    // shared entities first, the owner last.
    fn write_through(&mut self) -> DataResult<()> {
        let store = self.engine.shared_store();
        let mut dirty = BTreeSet::new();
        for ((shared, _), entry) in self.shared_entries.iter_mut() {
            if entry.stage(store)? {
                dirty.insert(shared.clone());
            }
        }
        for shared in dirty {
            // Resident while the entries pin it.
            store.persist(&store.pin(&shared).access())?;
            self.persisted.insert(shared);
        }

        if let Scope::Owner(held) = self.scope {
            let owners = self.engine.owners();
            let mut dirty = false;
            for entry in self.owner_entries.values_mut() {
                dirty |= entry.stage(owners, held)?;
            }
            if dirty {
                owners.persist(held)?;
            }
        }
        Ok(())
    }

    fn publish(&self) -> DataResult<()> {
        let expiry = self.engine.expiry();
        let owner = self.owner();
        if let Some(owner) = owner {
            for entry in self.owner_entries.values() {
                entry.arm(expiry, owner);
            }
        }
        for entry in self.shared_entries.values() {
            entry.arm(expiry);
        }

        if let Some(owner) = owner {
            for entry in self.owner_entries.values() {
                entry.notify(self.engine, owner)?;
            }
        }
        for entry in self.shared_entries.values() {
            entry.notify(self.engine)?;
        }
        Ok(())
    }

    fn rollback(&self) {
        if let Scope::Owner(held) = self.scope {
            for entry in self.owner_entries.values() {
                if let Err(err) = entry.restore(self.engine.owners(), held) {
                    warn!(owner = %held.key(), error = %err, "failed to restore cached value");
                }
            }
        }
        let store = self.engine.shared_store();
        for ((shared, _), entry) in &self.shared_entries {
            if let Err(err) = entry.restore(store) {
                warn!(entity = %shared, error = %err, "failed to restore cached value");
            }
        }
        // The owner is persisted last, so only shared entities can already
        // hold the new values in storage.
        for shared in &self.persisted {
            if let Err(err) = store.persist(&store.pin(shared).access()) {
                warn!(entity = %shared, error = %err, "failed to revert stored entity");
            }
        }
        debug!(owner = ?self.owner(), "transaction rolled back");
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("owner", &self.owner())
            .field("owner_fields", &self.owner_entries.len())
            .field("shared_fields", &self.shared_entries.len())
            .field("aborted", &self.aborted)
            .finish()
    }
}
