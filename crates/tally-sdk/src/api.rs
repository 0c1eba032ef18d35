use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use tally_codec::DataFormat;
use tally_core::{
    BucketLayout, DataError, DataResult, Engine, EngineOptions, Sweeper, Transaction, TxError,
    DEFAULT_SWEEP_INTERVAL,
};
use tally_events::{
    DistributedEventBus, LinkChange, MemoryChannel, Notifier, OwnerChanged, OwnerExpired, PubSub,
    SharedChanged, SharedExpired,
};
use tally_store::DataStorage;
use tally_types::{FieldValue, LinkKey, LinkType, LinkedField, OwnerField, OwnerId};

use crate::config::TallyConfig;
use crate::error::SdkResult;

/// Builds a [`DataApi`].
pub struct DataApiBuilder {
    storage: Arc<dyn DataStorage>,
    notifier: Notifier,
    options: EngineOptions,
    sweep_interval: Option<Duration>,
}

impl DataApiBuilder {
    pub fn format(mut self, format: DataFormat) -> Self {
        self.options.format = format;
        self
    }

    pub fn layout(mut self, layout: BucketLayout) -> Self {
        self.options.layout = layout;
        self
    }

    pub fn notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// Fan events out to other nodes over `pubsub`.
    pub fn distributed(
        mut self,
        pubsub: Arc<dyn PubSub>,
        node_id: impl Into<String>,
    ) -> SdkResult<Self> {
        self.notifier = Notifier::Distributed(DistributedEventBus::new(pubsub, node_id)?);
        Ok(self)
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Do not start the background sweeper. Expired fields still read as
    /// their default; expired events only fire on [`DataApi::sweep_now`].
    pub fn without_sweeper(mut self) -> Self {
        self.sweep_interval = None;
        self
    }

    pub fn build(self) -> SdkResult<DataApi> {
        let engine = Arc::new(Engine::new(self.storage, self.notifier, self.options));
        let sweeper = match self.sweep_interval {
            Some(interval) => {
                let weak: Weak<Engine> = Arc::downgrade(&engine);
                Some(Sweeper::start(interval, move || {
                    if let Some(engine) = weak.upgrade() {
                        engine.sweep();
                    }
                })?)
            }
            None => None,
        };
        info!(
            backend = engine.storage().backend_name(),
            format = %engine.format(),
            sweeper = sweeper.is_some(),
            "data api ready"
        );
        Ok(DataApi {
            engine,
            sweeper: Mutex::new(sweeper),
        })
    }
}

/// The entry point of the data layer.
///
/// Wraps one [`Engine`] and its expiry sweeper. Every operation is safe to
/// call from any thread. Listener registration fails with
/// [`DataError::ListenersUnsupported`] on storage backends that do not
/// support listeners.
pub struct DataApi {
    engine: Arc<Engine>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl DataApi {
    pub fn builder(storage: Arc<dyn DataStorage>) -> DataApiBuilder {
        DataApiBuilder {
            storage,
            notifier: Notifier::local(),
            options: EngineOptions::default(),
            sweep_interval: Some(DEFAULT_SWEEP_INTERVAL),
        }
    }

    /// Local events, JSON records, default layout and sweeper.
    pub fn new(storage: Arc<dyn DataStorage>) -> SdkResult<Self> {
        Self::builder(storage).build()
    }

    /// Build storage, layout and sweeper from `config`. Events stay local.
    pub fn from_config(config: &TallyConfig) -> SdkResult<Self> {
        Self::configured(config, config.open_storage())
    }

    /// As [`DataApi::from_config`], fanning events out over `pubsub`.
    pub fn from_config_distributed(config: &TallyConfig, pubsub: Arc<dyn PubSub>) -> SdkResult<Self> {
        let node_id = config.resolve_node_id();
        debug!(%node_id, "joining event channel");
        Self::configured_builder(config, config.open_storage())
            .distributed(pubsub, node_id)?
            .build()
    }

    /// As [`DataApi::from_config_distributed`] over a fresh in-process
    /// channel sized by `channel_capacity`. Returns the channel so that
    /// other nodes in the process can join it.
    pub fn from_config_in_process(config: &TallyConfig) -> SdkResult<(Self, MemoryChannel)> {
        let channel = MemoryChannel::with_capacity("tally", config.channel_capacity);
        let api = Self::from_config_distributed(config, Arc::new(channel.connect()))?;
        Ok((api, channel))
    }

    fn configured(config: &TallyConfig, storage: Arc<dyn DataStorage>) -> SdkResult<Self> {
        Self::configured_builder(config, storage).build()
    }

    fn configured_builder(config: &TallyConfig, storage: Arc<dyn DataStorage>) -> DataApiBuilder {
        let builder = Self::builder(storage)
            .format(config.format)
            .layout(config.layout());
        match config.sweep_interval() {
            Some(interval) => builder.sweep_interval(interval),
            None => builder.without_sweeper(),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn storage(&self) -> &Arc<dyn DataStorage> {
        self.engine.storage()
    }

    // ---- owner fields ----

    pub fn get<T: FieldValue>(&self, owner: OwnerId, field: &OwnerField<T>) -> DataResult<T> {
        self.engine.get(owner, field)
    }

    pub fn set<T: FieldValue>(&self, owner: OwnerId, field: &OwnerField<T>, value: T) -> DataResult<()> {
        self.engine.set(owner, field, value)
    }

    pub fn update<T: FieldValue>(
        &self,
        owner: OwnerId,
        field: &OwnerField<T>,
        f: impl FnOnce(T) -> T,
    ) -> DataResult<T> {
        self.engine.update(owner, field, f)
    }

    pub fn set_expiring<T: FieldValue>(
        &self,
        owner: OwnerId,
        field: &OwnerField<T>,
        value: T,
        ttl: Duration,
    ) -> DataResult<()> {
        self.engine.set_expiring(owner, field, value, ttl)
    }

    pub fn time_remaining<T: FieldValue>(&self, owner: OwnerId, field: &OwnerField<T>) -> Option<Duration> {
        self.engine.time_remaining(owner, field)
    }

    pub fn is_expired<T: FieldValue>(&self, owner: OwnerId, field: &OwnerField<T>) -> bool {
        self.engine.is_expired(owner, field)
    }

    pub fn extend<T: FieldValue>(
        &self,
        owner: OwnerId,
        field: &OwnerField<T>,
        extra: Duration,
    ) -> DataResult<()> {
        self.engine.extend(owner, field, extra)
    }

    // ---- linked fields ----

    pub fn get_linked<K: LinkKey, T: FieldValue>(
        &self,
        owner: OwnerId,
        field: &LinkedField<K, T>,
    ) -> DataResult<T> {
        self.engine.get_linked(owner, field)
    }

    pub fn set_linked<K: LinkKey, T: FieldValue>(
        &self,
        owner: OwnerId,
        field: &LinkedField<K, T>,
        value: T,
    ) -> DataResult<()> {
        self.engine.set_linked(owner, field, value)
    }

    pub fn update_linked<K: LinkKey, T: FieldValue>(
        &self,
        owner: OwnerId,
        field: &LinkedField<K, T>,
        f: impl FnOnce(T) -> T,
    ) -> DataResult<T> {
        self.engine.update_linked(owner, field, f)
    }

    pub fn set_linked_expiring<K: LinkKey, T: FieldValue>(
        &self,
        owner: OwnerId,
        field: &LinkedField<K, T>,
        value: T,
        ttl: Duration,
    ) -> DataResult<()> {
        self.engine.set_linked_expiring(owner, field, value, ttl)
    }

    pub fn time_remaining_linked<K: LinkKey, T: FieldValue>(
        &self,
        owner: OwnerId,
        field: &LinkedField<K, T>,
    ) -> Option<Duration> {
        self.engine.time_remaining_linked(owner, field)
    }

    pub fn is_expired_linked<K: LinkKey, T: FieldValue>(
        &self,
        owner: OwnerId,
        field: &LinkedField<K, T>,
    ) -> bool {
        self.engine.is_expired_linked(owner, field)
    }

    pub fn extend_linked<K: LinkKey, T: FieldValue>(
        &self,
        owner: OwnerId,
        field: &LinkedField<K, T>,
        extra: Duration,
    ) -> DataResult<()> {
        self.engine.extend_linked(owner, field, extra)
    }

    pub fn get_direct<K: LinkKey, T: FieldValue>(&self, key: &K, field: &LinkedField<K, T>) -> DataResult<T> {
        self.engine.get_direct(key, field)
    }

    pub fn set_direct<K: LinkKey, T: FieldValue>(
        &self,
        key: &K,
        field: &LinkedField<K, T>,
        value: T,
    ) -> DataResult<()> {
        self.engine.set_direct(key, field, value)
    }

    pub fn update_direct<K: LinkKey, T: FieldValue>(
        &self,
        key: &K,
        field: &LinkedField<K, T>,
        f: impl FnOnce(T) -> T,
    ) -> DataResult<T> {
        self.engine.update_direct(key, field, f)
    }

    pub fn set_direct_expiring<K: LinkKey, T: FieldValue>(
        &self,
        key: &K,
        field: &LinkedField<K, T>,
        value: T,
        ttl: Duration,
    ) -> DataResult<()> {
        self.engine.set_direct_expiring(key, field, value, ttl)
    }

    pub fn time_remaining_direct<K: LinkKey, T: FieldValue>(
        &self,
        key: &K,
        field: &LinkedField<K, T>,
    ) -> Option<Duration> {
        self.engine.time_remaining_direct(key, field)
    }

    pub fn is_expired_direct<K: LinkKey, T: FieldValue>(&self, key: &K, field: &LinkedField<K, T>) -> bool {
        self.engine.is_expired_direct(key, field)
    }

    pub fn extend_direct<K: LinkKey, T: FieldValue>(
        &self,
        key: &K,
        field: &LinkedField<K, T>,
        extra: Duration,
    ) -> DataResult<()> {
        self.engine.extend_direct(key, field, extra)
    }

    // ---- links ----

    pub fn link<K: LinkKey>(&self, owner: OwnerId, link: &LinkType<K>, key: K) -> DataResult<Option<K>> {
        self.engine.link(owner, link, key)
    }

    pub fn unlink<K: LinkKey>(&self, owner: OwnerId, link: &LinkType<K>) -> DataResult<Option<K>> {
        self.engine.unlink(owner, link)
    }

    pub fn link_key<K: LinkKey>(&self, owner: OwnerId, link: &LinkType<K>) -> Option<K> {
        self.engine.link_key(owner, link)
    }

    /// Re-register a stored link after the owner comes back, e.g. on login.
    pub fn restore_link<K: LinkKey>(&self, owner: OwnerId, link: &LinkType<K>) -> DataResult<Option<K>> {
        self.engine.restore_link(owner, link)
    }

    pub fn affected<K: LinkKey>(&self, link: &LinkType<K>, key: &K) -> BTreeSet<OwnerId> {
        self.engine.affected(link, key)
    }

    // ---- transactions ----

    pub fn transaction<R>(
        &self,
        owner: OwnerId,
        body: impl FnOnce(&mut Transaction<'_>) -> Result<R, TxError>,
    ) -> DataResult<Option<R>> {
        self.engine.transaction(owner, body)
    }

    pub fn transaction_direct<K: LinkKey, R>(
        &self,
        key: &K,
        link: &LinkType<K>,
        body: impl FnOnce(&mut Transaction<'_>) -> Result<R, TxError>,
    ) -> DataResult<Option<R>> {
        self.engine.transaction_direct(key, link, body)
    }

    // ---- subscriptions ----

    fn require_listeners(&self) -> DataResult<()> {
        let storage = self.engine.storage();
        if storage.supports_listeners() {
            Ok(())
        } else {
            Err(DataError::ListenersUnsupported {
                backend: storage.backend_name(),
            })
        }
    }

    pub fn on_change<T: FieldValue>(
        &self,
        field: &OwnerField<T>,
        listener: impl Fn(&OwnerChanged<T>) + Send + Sync + 'static,
    ) -> DataResult<()> {
        self.require_listeners()?;
        self.engine.on_owner_changed(field, listener);
        Ok(())
    }

    pub fn on_linked_change<K: LinkKey, T: FieldValue>(
        &self,
        field: &LinkedField<K, T>,
        listener: impl Fn(&SharedChanged<K, T>) + Send + Sync + 'static,
    ) -> DataResult<()> {
        self.require_listeners()?;
        self.engine.on_shared_changed(field, listener);
        Ok(())
    }

    pub fn on_link_change<K: LinkKey>(
        &self,
        link: &LinkType<K>,
        listener: impl Fn(&LinkChange<K>) + Send + Sync + 'static,
    ) -> DataResult<()> {
        self.require_listeners()?;
        self.engine.on_link_change(link, listener);
        Ok(())
    }

    pub fn on_expire<T: FieldValue>(
        &self,
        field: &OwnerField<T>,
        listener: impl Fn(&OwnerExpired<T>) + Send + Sync + 'static,
    ) -> DataResult<()> {
        self.require_listeners()?;
        self.engine.on_owner_expired(field, listener);
        Ok(())
    }

    pub fn on_linked_expire<K: LinkKey, T: FieldValue>(
        &self,
        field: &LinkedField<K, T>,
        listener: impl Fn(&SharedExpired<K, T>) + Send + Sync + 'static,
    ) -> DataResult<()> {
        self.require_listeners()?;
        self.engine.on_shared_expired(field, listener);
        Ok(())
    }

    // ---- maintenance ----

    /// Run one expiry sweep on the calling thread.
    pub fn sweep_now(&self) -> usize {
        self.engine.sweep()
    }

    pub fn evict_idle(&self) -> usize {
        self.engine.evict_idle()
    }

    /// Stop the sweeper and leave the event channel. Idempotent.
    pub fn shutdown(&self) {
        if let Some(mut sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
        self.engine.notifier().shutdown();
    }
}

impl Drop for DataApi {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DataApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataApi")
            .field("engine", &self.engine)
            .field("sweeper", &self.sweeper.lock().is_some())
            .finish()
    }
}
