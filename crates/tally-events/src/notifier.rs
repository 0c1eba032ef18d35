use std::sync::Arc;

use tally_types::{FieldValue, LinkKey, LinkType, LinkedField, OwnerField};

use crate::bus::EventBus;
use crate::distributed::DistributedEventBus;
use crate::error::EventResult;
use crate::event::{LinkChange, OwnerChanged, OwnerExpired, SharedChanged, SharedExpired, Topic};

/// The bus the data layer fires through.
#[derive(Clone, Debug)]
pub enum Notifier {
    Local(Arc<EventBus>),
    Distributed(Arc<DistributedEventBus>),
}

impl Notifier {
    pub fn local() -> Self {
        Self::Local(Arc::new(EventBus::new()))
    }

    /// The in-process bus, wrapped or not.
    pub fn bus(&self) -> &Arc<EventBus> {
        match self {
            Self::Local(bus) => bus,
            Self::Distributed(bus) => bus.local(),
        }
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self, Self::Distributed(_))
    }

    /// Whether anything here listens on `(topic, name)`. Distributed buses
    /// always publish, so they always report `true`.
    pub fn wants(&self, topic: Topic, name: &str) -> bool {
        match self {
            Self::Local(bus) => bus.has_listeners(topic, name),
            Self::Distributed(_) => true,
        }
    }

    pub fn shutdown(&self) {
        if let Self::Distributed(bus) = self {
            bus.shutdown();
        }
    }

    // ---- subscriptions ----

    pub fn on_owner_changed<T: FieldValue>(
        &self,
        field: &OwnerField<T>,
        listener: impl Fn(&OwnerChanged<T>) + Send + Sync + 'static,
    ) {
        match self {
            Self::Local(bus) => bus.on_owner_changed(field, listener),
            Self::Distributed(bus) => bus.on_owner_changed(field, listener),
        }
    }

    pub fn on_shared_changed<K: LinkKey, T: FieldValue>(
        &self,
        field: &LinkedField<K, T>,
        listener: impl Fn(&SharedChanged<K, T>) + Send + Sync + 'static,
    ) {
        match self {
            Self::Local(bus) => bus.on_shared_changed(field, listener),
            Self::Distributed(bus) => bus.on_shared_changed(field, listener),
        }
    }

    pub fn on_link_change<K: LinkKey>(
        &self,
        link: &LinkType<K>,
        listener: impl Fn(&LinkChange<K>) + Send + Sync + 'static,
    ) {
        match self {
            Self::Local(bus) => bus.on_link_change(link, listener),
            Self::Distributed(bus) => bus.on_link_change(link, listener),
        }
    }

    pub fn on_owner_expired<T: FieldValue>(
        &self,
        field: &OwnerField<T>,
        listener: impl Fn(&OwnerExpired<T>) + Send + Sync + 'static,
    ) {
        match self {
            Self::Local(bus) => bus.on_owner_expired(field, listener),
            Self::Distributed(bus) => bus.on_owner_expired(field, listener),
        }
    }

    pub fn on_shared_expired<K: LinkKey, T: FieldValue>(
        &self,
        field: &LinkedField<K, T>,
        listener: impl Fn(&SharedExpired<K, T>) + Send + Sync + 'static,
    ) {
        match self {
            Self::Local(bus) => bus.on_shared_expired(field, listener),
            Self::Distributed(bus) => bus.on_shared_expired(field, listener),
        }
    }

    // ---- firing ----

    pub fn fire_owner_changed<T: FieldValue>(
        &self,
        field: &OwnerField<T>,
        event: &OwnerChanged<T>,
    ) -> EventResult<()> {
        match self {
            Self::Local(bus) => {
                bus.fire_owner_changed(field, event);
                Ok(())
            }
            Self::Distributed(bus) => bus.fire_owner_changed(field, event),
        }
    }

    pub fn fire_shared_changed<K: LinkKey, T: FieldValue>(
        &self,
        field: &LinkedField<K, T>,
        event: &SharedChanged<K, T>,
    ) -> EventResult<()> {
        match self {
            Self::Local(bus) => {
                bus.fire_shared_changed(field, event);
                Ok(())
            }
            Self::Distributed(bus) => bus.fire_shared_changed(field, event),
        }
    }

    pub fn fire_link_change<K: LinkKey>(
        &self,
        link: &LinkType<K>,
        event: &LinkChange<K>,
    ) -> EventResult<()> {
        match self {
            Self::Local(bus) => {
                bus.fire_link_change(link, event);
                Ok(())
            }
            Self::Distributed(bus) => bus.fire_link_change(link, event),
        }
    }

    pub fn fire_owner_expired<T: FieldValue>(
        &self,
        field: &OwnerField<T>,
        event: &OwnerExpired<T>,
    ) -> EventResult<()> {
        match self {
            Self::Local(bus) => {
                bus.fire_owner_expired(field, event);
                Ok(())
            }
            Self::Distributed(bus) => bus.fire_owner_expired(field, event),
        }
    }

    pub fn fire_shared_expired<K: LinkKey, T: FieldValue>(
        &self,
        field: &LinkedField<K, T>,
        event: &SharedExpired<K, T>,
    ) -> EventResult<()> {
        match self {
            Self::Local(bus) => {
                bus.fire_shared_expired(field, event);
                Ok(())
            }
            Self::Distributed(bus) => bus.fire_shared_expired(field, event),
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::local()
    }
}
