use std::any::Any;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, warn};

use tally_codec::DataFormat;
use tally_events::{
    LinkChange, Notifier, OwnerChanged, OwnerExpired, SharedChanged, SharedExpired, Topic,
};
use tally_store::DataStorage;
use tally_types::{FieldValue, LinkKey, LinkType, LinkedField, OwnerField, OwnerId};

use crate::error::{DataError, DataResult, TxError};
use crate::expiry::ExpirationTracker;
use crate::key::{BucketLayout, EntityKey, ExpiryScope, SharedKey};
use crate::links::LinkRegistry;
use crate::store::EntityStore;
use crate::transaction::Transaction;

/// Storage encoding and layout used by an [`Engine`].
#[derive(Clone, Debug, Default)]
pub struct EngineOptions {
    pub format: DataFormat,
    pub layout: BucketLayout,
}

/// Fires the expired event of one field after the sweep purged it.
trait ExpiryHook: Send + Sync {
    /// Returns `true` if an event was fired.
    fn fire(&self, engine: &Engine, scope: &ExpiryScope) -> DataResult<bool>;
}

struct OwnerExpiryHook<T> {
    field: OwnerField<T>,
}

impl<T: FieldValue> ExpiryHook for OwnerExpiryHook<T> {
    fn fire(&self, engine: &Engine, scope: &ExpiryScope) -> DataResult<bool> {
        let ExpiryScope::Owner(owner) = scope else {
            return Ok(false);
        };
        engine.owners.with_lock(owner, |held| {
            // Re-armed between the sweep and now.
            if !engine.expiry.is_expired(scope, self.field.full_key()) {
                return Ok(false);
            }
            let value = engine.owners.read_raw(held, &self.field)?;
            engine.notifier.fire_owner_expired(
                &self.field,
                &OwnerExpired {
                    owner: *owner,
                    value,
                },
            )?;
            Ok(true)
        })
    }
}

struct SharedExpiryHook<K, T> {
    field: LinkedField<K, T>,
}

impl<K: LinkKey, T: FieldValue> ExpiryHook for SharedExpiryHook<K, T> {
    fn fire(&self, engine: &Engine, scope: &ExpiryScope) -> DataResult<bool> {
        let link = self.field.link_type();
        let ExpiryScope::Shared(shared) = scope else {
            return Ok(false);
        };
        if shared.link() != link.name() {
            return Ok(false);
        }
        let Some(key) = link.parse_id(shared.id()) else {
            warn!(entity = %shared, "cannot parse shared key of expired field");
            return Ok(false);
        };
        engine.shared.with_lock(shared, |held| {
            if !engine.expiry.is_expired(scope, self.field.full_key()) {
                return Ok(false);
            }
            let value = engine.shared.read_raw(held, &self.field)?;
            let members = engine.links.affected_shared(shared);
            engine.notifier.fire_shared_expired(
                &self.field,
                &SharedExpired {
                    key,
                    value,
                    members,
                },
            )?;
            Ok(true)
        })
    }
}

/// The data layer: owner and shared entity stores, links, expiration,
/// transactions and change notification over one storage backend.
///
/// Owner operations lock the owner. Linked operations resolve the owner's
/// link first and then lock only the shared entity. Direct operations address
/// a shared entity by key and never consult the link registry except to
/// compute who is affected by a change.
pub struct Engine {
    storage: Arc<dyn DataStorage>,
    options: EngineOptions,
    owners: EntityStore<OwnerId>,
    shared: EntityStore<SharedKey>,
    links: LinkRegistry,
    expiry: Arc<ExpirationTracker>,
    notifier: Notifier,
    expiry_hooks: DashMap<Arc<str>, Arc<dyn ExpiryHook>>,
}

impl Engine {
    pub fn new(storage: Arc<dyn DataStorage>, notifier: Notifier, options: EngineOptions) -> Self {
        let expiry = Arc::new(ExpirationTracker::new());
        let owners = EntityStore::new(
            storage.clone(),
            options.format,
            options.layout.clone(),
            expiry.clone(),
        );
        let shared = EntityStore::new(
            storage.clone(),
            options.format,
            options.layout.clone(),
            expiry.clone(),
        );
        debug!(
            backend = storage.backend_name(),
            format = %options.format,
            distributed = notifier.is_distributed(),
            "engine created"
        );
        Self {
            storage,
            options,
            owners,
            shared,
            links: LinkRegistry::new(),
            expiry,
            notifier,
            expiry_hooks: DashMap::new(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn DataStorage> {
        &self.storage
    }

    pub fn format(&self) -> DataFormat {
        self.options.format
    }

    pub fn layout(&self) -> &BucketLayout {
        &self.options.layout
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn links(&self) -> &LinkRegistry {
        &self.links
    }

    pub fn expiry(&self) -> &ExpirationTracker {
        &self.expiry
    }

    pub fn owners(&self) -> &EntityStore<OwnerId> {
        &self.owners
    }

    pub fn shared_store(&self) -> &EntityStore<SharedKey> {
        &self.shared
    }

    // ---- owner fields ----

    pub fn get<T: FieldValue>(&self, owner: OwnerId, field: &OwnerField<T>) -> DataResult<T> {
        self.owners.get(&owner, field)
    }

    /// Set an owner field. Expiring fields get their default TTL.
    pub fn set<T: FieldValue>(&self, owner: OwnerId, field: &OwnerField<T>, value: T) -> DataResult<()> {
        self.owners
            .set(&owner, field, value, None, |old, new| {
                self.notify_owner(field, owner, old, new)
            })
            .map(drop)
    }

    /// Atomically transform an owner field. Returns the new value.
    pub fn update<T: FieldValue>(
        &self,
        owner: OwnerId,
        field: &OwnerField<T>,
        f: impl FnOnce(T) -> T,
    ) -> DataResult<T> {
        self.owners.update(&owner, field, f, None, |old, new| {
            self.notify_owner(field, owner, old, new)
        })
    }

    /// Like [`Engine::update`], but only when `keep` accepts the current
    /// value. Returns the new value if the update happened.
    pub fn update_if<T: FieldValue>(
        &self,
        owner: OwnerId,
        field: &OwnerField<T>,
        keep: impl FnOnce(&T) -> bool,
        f: impl FnOnce(T) -> T,
    ) -> DataResult<Option<T>> {
        self.owners.with_lock(&owner, |held| {
            let current = self.owners.read(held, field)?;
            if !keep(&current) {
                return Ok(None);
            }
            self.update(owner, field, f).map(Some)
        })
    }

    /// Set an expiring owner field with an explicit TTL.
    pub fn set_expiring<T: FieldValue>(
        &self,
        owner: OwnerId,
        field: &OwnerField<T>,
        value: T,
        ttl: Duration,
    ) -> DataResult<()> {
        require_expiring(field.ttl(), field.full_key())?;
        self.owners
            .set(&owner, field, value, Some(ttl), |old, new| {
                self.notify_owner(field, owner, old, new)
            })
            .map(drop)
    }

    pub fn time_remaining<T: FieldValue>(&self, owner: OwnerId, field: &OwnerField<T>) -> Option<Duration> {
        self.expiry
            .time_remaining(&ExpiryScope::Owner(owner), field.full_key())
    }

    pub fn is_expired<T: FieldValue>(&self, owner: OwnerId, field: &OwnerField<T>) -> bool {
        self.expiry.is_expired(&ExpiryScope::Owner(owner), field.full_key())
    }

    pub fn extend<T: FieldValue>(
        &self,
        owner: OwnerId,
        field: &OwnerField<T>,
        extra: Duration,
    ) -> DataResult<()> {
        self.owners.with_lock(&owner, |_| {
            self.expiry
                .extend(&ExpiryScope::Owner(owner), field.full_key(), extra)
        })
    }

    // ---- linked fields, through an owner's link ----

    /// The value on the shared entity `owner` is linked to, or the default
    /// when unlinked.
    pub fn get_linked<K: LinkKey, T: FieldValue>(
        &self,
        owner: OwnerId,
        field: &LinkedField<K, T>,
    ) -> DataResult<T> {
        match self.links.resolve(owner, field.link_type()) {
            Some(key) => self.get_direct(&key, field),
            None => Ok(field.default_value()),
        }
    }

    pub fn set_linked<K: LinkKey, T: FieldValue>(
        &self,
        owner: OwnerId,
        field: &LinkedField<K, T>,
        value: T,
    ) -> DataResult<()> {
        let key = self.require_link(owner, field.link_type())?;
        self.set_direct(&key, field, value)
    }

    pub fn update_linked<K: LinkKey, T: FieldValue>(
        &self,
        owner: OwnerId,
        field: &LinkedField<K, T>,
        f: impl FnOnce(T) -> T,
    ) -> DataResult<T> {
        let key = self.require_link(owner, field.link_type())?;
        self.update_direct(&key, field, f)
    }

    pub fn set_linked_expiring<K: LinkKey, T: FieldValue>(
        &self,
        owner: OwnerId,
        field: &LinkedField<K, T>,
        value: T,
        ttl: Duration,
    ) -> DataResult<()> {
        let key = self.require_link(owner, field.link_type())?;
        self.set_direct_expiring(&key, field, value, ttl)
    }

    pub fn time_remaining_linked<K: LinkKey, T: FieldValue>(
        &self,
        owner: OwnerId,
        field: &LinkedField<K, T>,
    ) -> Option<Duration> {
        let key = self.links.resolve(owner, field.link_type())?;
        self.time_remaining_direct(&key, field)
    }

    pub fn is_expired_linked<K: LinkKey, T: FieldValue>(
        &self,
        owner: OwnerId,
        field: &LinkedField<K, T>,
    ) -> bool {
        self.time_remaining_linked(owner, field).is_none()
    }

    pub fn extend_linked<K: LinkKey, T: FieldValue>(
        &self,
        owner: OwnerId,
        field: &LinkedField<K, T>,
        extra: Duration,
    ) -> DataResult<()> {
        let key = self.require_link(owner, field.link_type())?;
        self.extend_direct(&key, field, extra)
    }

    // ---- linked fields, by shared key ----

    pub fn get_direct<K: LinkKey, T: FieldValue>(
        &self,
        key: &K,
        field: &LinkedField<K, T>,
    ) -> DataResult<T> {
        self.shared.get(&SharedKey::of(field.link_type(), key), field)
    }

    pub fn set_direct<K: LinkKey, T: FieldValue>(
        &self,
        key: &K,
        field: &LinkedField<K, T>,
        value: T,
    ) -> DataResult<()> {
        let shared = SharedKey::of(field.link_type(), key);
        self.shared
            .set(&shared, field, value, None, |old, new| {
                self.notify_shared(field, key, &shared, old, new)
            })
            .map(drop)
    }

    pub fn update_direct<K: LinkKey, T: FieldValue>(
        &self,
        key: &K,
        field: &LinkedField<K, T>,
        f: impl FnOnce(T) -> T,
    ) -> DataResult<T> {
        let shared = SharedKey::of(field.link_type(), key);
        self.shared.update(&shared, field, f, None, |old, new| {
            self.notify_shared(field, key, &shared, old, new)
        })
    }

    pub fn set_direct_expiring<K: LinkKey, T: FieldValue>(
        &self,
        key: &K,
        field: &LinkedField<K, T>,
        value: T,
        ttl: Duration,
    ) -> DataResult<()> {
        require_expiring(field.ttl(), field.full_key())?;
        let shared = SharedKey::of(field.link_type(), key);
        self.shared
            .set(&shared, field, value, Some(ttl), |old, new| {
                self.notify_shared(field, key, &shared, old, new)
            })
            .map(drop)
    }

    pub fn time_remaining_direct<K: LinkKey, T: FieldValue>(
        &self,
        key: &K,
        field: &LinkedField<K, T>,
    ) -> Option<Duration> {
        let scope = ExpiryScope::Shared(SharedKey::of(field.link_type(), key));
        self.expiry.time_remaining(&scope, field.full_key())
    }

    pub fn is_expired_direct<K: LinkKey, T: FieldValue>(
        &self,
        key: &K,
        field: &LinkedField<K, T>,
    ) -> bool {
        self.time_remaining_direct(key, field).is_none()
    }

    pub fn extend_direct<K: LinkKey, T: FieldValue>(
        &self,
        key: &K,
        field: &LinkedField<K, T>,
        extra: Duration,
    ) -> DataResult<()> {
        let shared = SharedKey::of(field.link_type(), key);
        self.shared.with_lock(&shared, |held| {
            self.expiry
                .extend(&held.key().expiry_scope(), field.full_key(), extra)
        })
    }

    // ---- links ----

    /// Link `owner` to `key`, replacing any previous link of this type. The
    /// back-reference field is persisted before listeners are told.
    pub fn link<K: LinkKey>(&self, owner: OwnerId, link: &LinkType<K>, key: K) -> DataResult<Option<K>> {
        self.owners.with_lock(&owner, |held| {
            let previous = self.links.link(owner, link, key.clone());
            if let Err(err) = self.owners.write(held, link.back_ref(), Some(key.clone())) {
                match &previous {
                    Some(previous) => {
                        self.links.link(owner, link, previous.clone());
                    }
                    None => {
                        self.links.unlink(owner, link);
                    }
                }
                return Err(err);
            }
            debug!(%owner, link = link.name(), %key, "linked");
            self.notify_link(link, LinkChange::Linked { owner, key })?;
            Ok(previous)
        })
    }

    /// Remove the owner's link of this type, returning the key it pointed at.
    pub fn unlink<K: LinkKey>(&self, owner: OwnerId, link: &LinkType<K>) -> DataResult<Option<K>> {
        self.owners.with_lock(&owner, |held| {
            let Some(previous) = self.links.unlink(owner, link) else {
                return Ok(None);
            };
            if let Err(err) = self.owners.write(held, link.back_ref(), None) {
                self.links.link(owner, link, previous.clone());
                return Err(err);
            }
            debug!(%owner, link = link.name(), key = %previous, "unlinked");
            self.notify_link(
                link,
                LinkChange::Unlinked {
                    owner,
                    previous: previous.clone(),
                },
            )?;
            Ok(Some(previous))
        })
    }

    pub fn link_key<K: LinkKey>(&self, owner: OwnerId, link: &LinkType<K>) -> Option<K> {
        self.links.resolve(owner, link)
    }

    /// Rebuild the registry entry for `owner` from its persisted
    /// back-reference, e.g. when the owner comes online. Fires no event.
    pub fn restore_link<K: LinkKey>(&self, owner: OwnerId, link: &LinkType<K>) -> DataResult<Option<K>> {
        self.owners.with_lock(&owner, |held| {
            let stored = self.owners.read(held, link.back_ref())?;
            if let Some(key) = &stored {
                self.links.link(owner, link, key.clone());
            }
            Ok(stored)
        })
    }

    /// Owners currently linked to `key`.
    pub fn affected<K: LinkKey>(&self, link: &LinkType<K>, key: &K) -> BTreeSet<OwnerId> {
        self.links.affected(link, key)
    }

    // ---- transactions ----

    /// Run `body` as one transaction on `owner`, holding the owner's lock
    /// throughout.
    ///
    /// Returns `Some` with the body's result once committed, `None` if the
    /// body aborted. A failing body is rolled back and its error returned.
    pub fn transaction<R>(
        &self,
        owner: OwnerId,
        body: impl FnOnce(&mut Transaction<'_>) -> Result<R, TxError>,
    ) -> DataResult<Option<R>> {
        self.owners.with_lock(&owner, |held| {
            let mut tx = Transaction::for_owner(self, held);
            let outcome = body(&mut tx);
            tx.conclude(outcome)
        })
    }

    /// Run `body` as one transaction on a single shared entity, bypassing
    /// link resolution. Owner fields are not available inside.
    pub fn transaction_direct<K: LinkKey, R>(
        &self,
        key: &K,
        link: &LinkType<K>,
        body: impl FnOnce(&mut Transaction<'_>) -> Result<R, TxError>,
    ) -> DataResult<Option<R>> {
        let shared = SharedKey::of(link, key);
        let scoped: Arc<dyn Any + Send + Sync> = Arc::new(key.clone());
        self.shared.with_lock(&shared, |held| {
            let mut tx = Transaction::direct(self, link.name_arc(), scoped, held);
            let outcome = body(&mut tx);
            tx.conclude(outcome)
        })
    }

    // ---- subscriptions ----

    pub fn on_owner_changed<T: FieldValue>(
        &self,
        field: &OwnerField<T>,
        listener: impl Fn(&OwnerChanged<T>) + Send + Sync + 'static,
    ) {
        self.notifier.on_owner_changed(field, listener);
    }

    pub fn on_shared_changed<K: LinkKey, T: FieldValue>(
        &self,
        field: &LinkedField<K, T>,
        listener: impl Fn(&SharedChanged<K, T>) + Send + Sync + 'static,
    ) {
        self.notifier.on_shared_changed(field, listener);
    }

    pub fn on_link_change<K: LinkKey>(
        &self,
        link: &LinkType<K>,
        listener: impl Fn(&LinkChange<K>) + Send + Sync + 'static,
    ) {
        self.notifier.on_link_change(link, listener);
    }

    /// Listen for an expiring owner field lapsing. Delivered by [`Engine::sweep`].
    pub fn on_owner_expired<T: FieldValue>(
        &self,
        field: &OwnerField<T>,
        listener: impl Fn(&OwnerExpired<T>) + Send + Sync + 'static,
    ) {
        self.notifier.on_owner_expired(field, listener);
        self.expiry_hooks.insert(
            field.full_key_arc(),
            Arc::new(OwnerExpiryHook {
                field: field.clone(),
            }),
        );
    }

    pub fn on_shared_expired<K: LinkKey, T: FieldValue>(
        &self,
        field: &LinkedField<K, T>,
        listener: impl Fn(&SharedExpired<K, T>) + Send + Sync + 'static,
    ) {
        self.notifier.on_shared_expired(field, listener);
        self.expiry_hooks.insert(
            field.full_key_arc(),
            Arc::new(SharedExpiryHook {
                field: field.clone(),
            }),
        );
    }

    // ---- maintenance ----

    /// Purge lapsed deadlines and fire expired events for fields someone
    /// listens to. Returns the number of events fired.
    pub fn sweep(&self) -> usize {
        let mut fired = 0;
        for (scope, field) in self.expiry.sweep() {
            let Some(hook) = self.expiry_hooks.get(&field).map(|hook| hook.clone()) else {
                continue;
            };
            match hook.fire(self, &scope) {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(err) => warn!(%scope, field = &*field, error = %err, "expired event failed"),
            }
        }
        fired
    }

    /// Drop cached entities that are not in use. Returns how many went.
    pub fn evict_idle(&self) -> usize {
        self.owners.evict_idle() + self.shared.evict_idle()
    }

    // ---- notification ----

    pub(crate) fn notify_owner<T: FieldValue>(
        &self,
        field: &OwnerField<T>,
        owner: OwnerId,
        old: &T,
        new: &T,
    ) -> DataResult<()> {
        if !self.notifier.wants(Topic::OwnerData, field.full_key()) {
            return Ok(());
        }
        self.notifier.fire_owner_changed(
            field,
            &OwnerChanged {
                owner,
                old: old.clone(),
                new: new.clone(),
            },
        )?;
        Ok(())
    }

    pub(crate) fn notify_shared<K: LinkKey, T: FieldValue>(
        &self,
        field: &LinkedField<K, T>,
        key: &K,
        shared: &SharedKey,
        old: &T,
        new: &T,
    ) -> DataResult<()> {
        if !self.notifier.wants(Topic::SharedData, field.full_key()) {
            return Ok(());
        }
        self.notifier.fire_shared_changed(
            field,
            &SharedChanged {
                key: key.clone(),
                old: old.clone(),
                new: new.clone(),
                affected: self.links.affected_shared(shared),
            },
        )?;
        Ok(())
    }

    fn notify_link<K: LinkKey>(&self, link: &LinkType<K>, change: LinkChange<K>) -> DataResult<()> {
        if !self.notifier.wants(Topic::Link, link.name()) {
            return Ok(());
        }
        self.notifier.fire_link_change(link, &change)?;
        Ok(())
    }

    fn require_link<K: LinkKey>(&self, owner: OwnerId, link: &LinkType<K>) -> DataResult<K> {
        self.links
            .resolve(owner, link)
            .ok_or_else(|| DataError::NotLinked {
                owner,
                link_type: link.name().to_string(),
            })
    }
}

fn require_expiring(ttl: Option<Duration>, field: &str) -> DataResult<()> {
    match ttl {
        Some(_) => Ok(()),
        None => Err(DataError::NotExpiring {
            field: field.to_string(),
        }),
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("backend", &self.storage.backend_name())
            .field("format", &self.options.format)
            .field("links", &self.links)
            .field("expiry", &self.expiry)
            .field("distributed", &self.notifier.is_distributed())
            .finish()
    }
}
