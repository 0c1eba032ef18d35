use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use tally_types::{FieldValue, LinkKey, LinkType, LinkedField, OwnerField};

use crate::bus::EventBus;
use crate::envelope::{from_value, to_value, Envelope, EnvelopeBody};
use crate::error::{EventError, EventResult};
use crate::event::{LinkChange, OwnerChanged, OwnerExpired, SharedChanged, SharedExpired, Topic};
use crate::pubsub::PubSub;

/// Decodes an inbound envelope body and re-fires it on the local bus.
trait InboundHandler: Send + Sync {
    fn deliver(&self, body: EnvelopeBody, local: &EventBus) -> EventResult<()>;
}

struct OwnerFieldInbound<T> {
    field: OwnerField<T>,
}

impl<T: FieldValue> InboundHandler for OwnerFieldInbound<T> {
    fn deliver(&self, body: EnvelopeBody, local: &EventBus) -> EventResult<()> {
        let codec = self.field.codec().as_ref();
        match body {
            EnvelopeBody::OwnerChanged { owner, old, new } => {
                let event = OwnerChanged {
                    owner,
                    old: from_value(codec, &old)?,
                    new: from_value(codec, &new)?,
                };
                local.fire_owner_changed(&self.field, &event);
            }
            EnvelopeBody::OwnerExpired { owner, value } => {
                let event = OwnerExpired {
                    owner,
                    value: from_value(codec, &value)?,
                };
                local.fire_owner_expired(&self.field, &event);
            }
            other => return Err(unexpected(&other, "an owner field")),
        }
        Ok(())
    }
}

struct LinkedFieldInbound<K, T> {
    field: LinkedField<K, T>,
}

impl<K: LinkKey, T: FieldValue> InboundHandler for LinkedFieldInbound<K, T> {
    fn deliver(&self, body: EnvelopeBody, local: &EventBus) -> EventResult<()> {
        let codec = self.field.codec().as_ref();
        let key_codec = self.field.link_type().key_codec().as_ref();
        match body {
            EnvelopeBody::SharedChanged {
                key,
                old,
                new,
                affected,
            } => {
                let event = SharedChanged {
                    key: from_value(key_codec, &key)?,
                    old: from_value(codec, &old)?,
                    new: from_value(codec, &new)?,
                    affected,
                };
                local.fire_shared_changed(&self.field, &event);
            }
            EnvelopeBody::SharedExpired {
                key,
                value,
                members,
            } => {
                let event = SharedExpired {
                    key: from_value(key_codec, &key)?,
                    value: from_value(codec, &value)?,
                    members,
                };
                local.fire_shared_expired(&self.field, &event);
            }
            other => return Err(unexpected(&other, "a linked field")),
        }
        Ok(())
    }
}

struct LinkInbound<K> {
    link: LinkType<K>,
}

impl<K: LinkKey> InboundHandler for LinkInbound<K> {
    fn deliver(&self, body: EnvelopeBody, local: &EventBus) -> EventResult<()> {
        let key_codec = self.link.key_codec().as_ref();
        let event = match body {
            EnvelopeBody::Linked { owner, key } => LinkChange::Linked {
                owner,
                key: from_value(key_codec, &key)?,
            },
            EnvelopeBody::Unlinked { owner, previous } => LinkChange::Unlinked {
                owner,
                previous: from_value(key_codec, &previous)?,
            },
            other => return Err(unexpected(&other, "a link type")),
        };
        local.fire_link_change(&self.link, &event);
        Ok(())
    }
}

fn unexpected(body: &EnvelopeBody, target: &str) -> EventError {
    EventError::Envelope(format!("{:?} event addressed to {target}", body.topic()))
}

/// Event bus that also propagates every event to other nodes.
///
/// Local listeners run synchronously as with a plain [`EventBus`]; the same
/// event is then published on the shared channel. Messages from the channel
/// are dropped when they originate from this node or name a field or link
/// type nobody subscribed to here; otherwise they are decoded and fired on
/// the local bus only, never re-published.
///
/// Subscribing through this bus registers the field for inbound decoding.
/// A node that never subscribes to a field never decodes its events.
pub struct DistributedEventBus {
    local: Arc<EventBus>,
    pubsub: Arc<dyn PubSub>,
    node_id: Arc<str>,
    fields: DashMap<Arc<str>, Arc<dyn InboundHandler>>,
    links: DashMap<Arc<str>, Arc<dyn InboundHandler>>,
}

impl DistributedEventBus {
    /// Create a bus over a fresh local bus and start the subscriber.
    pub fn new(pubsub: Arc<dyn PubSub>, node_id: impl Into<String>) -> EventResult<Arc<Self>> {
        Self::with_local(Arc::new(EventBus::new()), pubsub, node_id)
    }

    pub fn with_local(
        local: Arc<EventBus>,
        pubsub: Arc<dyn PubSub>,
        node_id: impl Into<String>,
    ) -> EventResult<Arc<Self>> {
        let node_id: String = node_id.into();
        let bus = Arc::new(Self {
            local,
            pubsub,
            node_id: node_id.into(),
            fields: DashMap::new(),
            links: DashMap::new(),
        });

        let weak = Arc::downgrade(&bus);
        bus.pubsub.subscribe(Box::new(move |message| {
            if let Some(bus) = weak.upgrade() {
                bus.handle_message(message);
            }
        }))?;
        Ok(bus)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The wrapped local bus. Firing on it directly does not publish.
    pub fn local(&self) -> &Arc<EventBus> {
        &self.local
    }

    pub fn shutdown(&self) {
        self.pubsub.shutdown();
    }

    // ---- inbound registration ----

    pub fn register_owner_field<T: FieldValue>(&self, field: &OwnerField<T>) {
        self.fields.insert(
            field.full_key_arc(),
            Arc::new(OwnerFieldInbound {
                field: field.clone(),
            }),
        );
    }

    pub fn register_linked_field<K: LinkKey, T: FieldValue>(&self, field: &LinkedField<K, T>) {
        self.fields.insert(
            field.full_key_arc(),
            Arc::new(LinkedFieldInbound {
                field: field.clone(),
            }),
        );
    }

    pub fn register_link_type<K: LinkKey>(&self, link: &LinkType<K>) {
        self.links
            .insert(link.name_arc(), Arc::new(LinkInbound { link: link.clone() }));
    }

    pub fn is_registered(&self, topic: Topic, name: &str) -> bool {
        match topic {
            Topic::Link => self.links.contains_key(name),
            _ => self.fields.contains_key(name),
        }
    }

    // ---- subscriptions ----

    pub fn on_owner_changed<T: FieldValue>(
        &self,
        field: &OwnerField<T>,
        listener: impl Fn(&OwnerChanged<T>) + Send + Sync + 'static,
    ) {
        self.register_owner_field(field);
        self.local.on_owner_changed(field, listener);
    }

    pub fn on_shared_changed<K: LinkKey, T: FieldValue>(
        &self,
        field: &LinkedField<K, T>,
        listener: impl Fn(&SharedChanged<K, T>) + Send + Sync + 'static,
    ) {
        self.register_linked_field(field);
        self.local.on_shared_changed(field, listener);
    }

    pub fn on_link_change<K: LinkKey>(
        &self,
        link: &LinkType<K>,
        listener: impl Fn(&LinkChange<K>) + Send + Sync + 'static,
    ) {
        self.register_link_type(link);
        self.local.on_link_change(link, listener);
    }

    pub fn on_owner_expired<T: FieldValue>(
        &self,
        field: &OwnerField<T>,
        listener: impl Fn(&OwnerExpired<T>) + Send + Sync + 'static,
    ) {
        self.register_owner_field(field);
        self.local.on_owner_expired(field, listener);
    }

    pub fn on_shared_expired<K: LinkKey, T: FieldValue>(
        &self,
        field: &LinkedField<K, T>,
        listener: impl Fn(&SharedExpired<K, T>) + Send + Sync + 'static,
    ) {
        self.register_linked_field(field);
        self.local.on_shared_expired(field, listener);
    }

    // ---- firing ----

    pub fn fire_owner_changed<T: FieldValue>(
        &self,
        field: &OwnerField<T>,
        event: &OwnerChanged<T>,
    ) -> EventResult<()> {
        self.local.fire_owner_changed(field, event);
        let codec = field.codec().as_ref();
        self.publish(
            field.full_key(),
            EnvelopeBody::OwnerChanged {
                owner: event.owner,
                old: to_value(codec, &event.old)?,
                new: to_value(codec, &event.new)?,
            },
        )
    }

    pub fn fire_shared_changed<K: LinkKey, T: FieldValue>(
        &self,
        field: &LinkedField<K, T>,
        event: &SharedChanged<K, T>,
    ) -> EventResult<()> {
        self.local.fire_shared_changed(field, event);
        let codec = field.codec().as_ref();
        self.publish(
            field.full_key(),
            EnvelopeBody::SharedChanged {
                key: to_value(field.link_type().key_codec().as_ref(), &event.key)?,
                old: to_value(codec, &event.old)?,
                new: to_value(codec, &event.new)?,
                affected: event.affected.clone(),
            },
        )
    }

    pub fn fire_link_change<K: LinkKey>(
        &self,
        link: &LinkType<K>,
        event: &LinkChange<K>,
    ) -> EventResult<()> {
        self.local.fire_link_change(link, event);
        let key_codec = link.key_codec().as_ref();
        let body = match event {
            LinkChange::Linked { owner, key } => EnvelopeBody::Linked {
                owner: *owner,
                key: to_value(key_codec, key)?,
            },
            LinkChange::Unlinked { owner, previous } => EnvelopeBody::Unlinked {
                owner: *owner,
                previous: to_value(key_codec, previous)?,
            },
        };
        self.publish(link.name(), body)
    }

    pub fn fire_owner_expired<T: FieldValue>(
        &self,
        field: &OwnerField<T>,
        event: &OwnerExpired<T>,
    ) -> EventResult<()> {
        self.local.fire_owner_expired(field, event);
        self.publish(
            field.full_key(),
            EnvelopeBody::OwnerExpired {
                owner: event.owner,
                value: to_value(field.codec().as_ref(), &event.value)?,
            },
        )
    }

    pub fn fire_shared_expired<K: LinkKey, T: FieldValue>(
        &self,
        field: &LinkedField<K, T>,
        event: &SharedExpired<K, T>,
    ) -> EventResult<()> {
        self.local.fire_shared_expired(field, event);
        self.publish(
            field.full_key(),
            EnvelopeBody::SharedExpired {
                key: to_value(field.link_type().key_codec().as_ref(), &event.key)?,
                value: to_value(field.codec().as_ref(), &event.value)?,
                members: event.members.clone(),
            },
        )
    }

    fn publish(&self, name: &str, body: EnvelopeBody) -> EventResult<()> {
        let envelope = Envelope {
            name: name.to_string(),
            origin: self.node_id.to_string(),
            body,
        };
        self.pubsub.publish(&envelope.to_json()?)
    }

    // ---- inbound ----

    fn handle_message(&self, text: &str) {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping malformed envelope");
                return;
            }
        };
        if *envelope.origin == *self.node_id {
            return;
        }

        let topic = envelope.body.topic();
        let registry = match topic {
            Topic::Link => &self.links,
            _ => &self.fields,
        };
        // Clone out so no shard lock is held while listeners run.
        let Some(handler) = registry.get(envelope.name.as_str()).map(|h| h.value().clone()) else {
            debug!(name = %envelope.name, ?topic, "no local registration, dropping");
            return;
        };

        let name = envelope.name;
        match catch_unwind(AssertUnwindSafe(|| handler.deliver(envelope.body, &self.local))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(name = %name, error = %e, "dropping undecodable event"),
            Err(_) => warn!(name = %name, "listener panicked on remote event"),
        }
    }
}

impl std::fmt::Debug for DistributedEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedEventBus")
            .field("node_id", &self.node_id)
            .field("fields", &self.fields.len())
            .field("links", &self.links.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{MemoryChannel, MemoryPubSub};
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;
    use tally_types::{field, OwnerId};

    const WAIT: Duration = Duration::from_secs(5);
    const SETTLE: Duration = Duration::from_millis(150);

    fn node(channel: &MemoryChannel, id: &str) -> Arc<DistributedEventBus> {
        let pubsub: Arc<dyn PubSub> = Arc::new(channel.connect());
        DistributedEventBus::new(pubsub, id).unwrap()
    }

    #[test]
    fn each_node_sees_each_event_exactly_once() {
        let channel = MemoryChannel::new("events");
        let a = node(&channel, "a");
        let b = node(&channel, "b");
        let coins = field("economy", "coins", 0i64).owner();

        let a_hits = Arc::new(AtomicUsize::new(0));
        let hits = a_hits.clone();
        a.on_owner_changed(&coins, move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        let (tx, rx) = mpsc::channel();
        b.on_owner_changed(&coins, move |e: &OwnerChanged<i64>| {
            tx.send(e.clone()).unwrap();
        });

        let owner = OwnerId::new();
        let event = OwnerChanged { owner, old: 0, new: 500 };
        a.fire_owner_changed(&coins, &event).unwrap();

        assert_eq!(a_hits.load(Ordering::SeqCst), 1);
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), event);
        std::thread::sleep(SETTLE);
        assert_eq!(a_hits.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn remote_events_are_not_republished() {
        let channel = MemoryChannel::new("echo");
        let a = node(&channel, "a");
        let b = node(&channel, "b");
        let c = node(&channel, "c");
        let level = field("stats", "level", 1u32).owner();

        let counters: Vec<Arc<AtomicUsize>> = [&b, &c]
            .iter()
            .map(|bus| {
                let hits = Arc::new(AtomicUsize::new(0));
                let h = hits.clone();
                bus.on_owner_changed(&level, move |_| {
                    h.fetch_add(1, Ordering::SeqCst);
                });
                hits
            })
            .collect();

        a.fire_owner_changed(&level, &OwnerChanged { owner: OwnerId::new(), old: 1, new: 2 })
            .unwrap();
        std::thread::sleep(SETTLE * 2);
        for hits in counters {
            assert_eq!(hits.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn unregistered_names_are_dropped() {
        let channel = MemoryChannel::new("lazy");
        let a = node(&channel, "a");
        let b = node(&channel, "b");
        let gems = field("economy", "gems", 0u32).owner();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        // Subscribed on the wrapped local bus, so "gems" is never registered.
        b.local().on_owner_changed(&gems, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!b.is_registered(Topic::OwnerData, "economy:gems"));

        a.fire_owner_changed(&gems, &OwnerChanged { owner: OwnerId::new(), old: 0, new: 1 })
            .unwrap();
        std::thread::sleep(SETTLE);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn link_changes_and_shared_events_cross_nodes() {
        let channel = MemoryChannel::new("links");
        let a = node(&channel, "a");
        let b = node(&channel, "b");
        let island = LinkType::<String>::serde("island");
        let bank = field("island", "bank", 0i64).linked(&island);

        let (link_tx, link_rx) = mpsc::channel();
        b.on_link_change(&island, move |e: &LinkChange<String>| link_tx.send(e.clone()).unwrap());
        let (bank_tx, bank_rx) = mpsc::channel();
        b.on_shared_changed(&bank, move |e: &SharedChanged<String, i64>| {
            bank_tx.send(e.clone()).unwrap()
        });

        let owner = OwnerId::new();
        a.fire_link_change(&island, &LinkChange::Linked { owner, key: "isle-1".into() })
            .unwrap();
        let shared = SharedChanged {
            key: "isle-1".to_string(),
            old: 0,
            new: 75,
            affected: BTreeSet::from([owner]),
        };
        a.fire_shared_changed(&bank, &shared).unwrap();

        assert_eq!(
            link_rx.recv_timeout(WAIT).unwrap(),
            LinkChange::Linked { owner, key: "isle-1".into() }
        );
        assert_eq!(bank_rx.recv_timeout(WAIT).unwrap(), shared);
    }

    #[test]
    fn subscriber_survives_garbage_and_panics() {
        let channel = MemoryChannel::new("robust");
        let raw: MemoryPubSub = channel.connect();
        let a = node(&channel, "a");
        let b = node(&channel, "b");
        let hp = field("stats", "hp", 20u32).owner();

        b.on_owner_changed(&hp, |e: &OwnerChanged<u32>| {
            if e.new == 0 {
                panic!("listener failure");
            }
        });
        let (tx, rx) = mpsc::channel();
        b.on_owner_changed(&hp, move |e: &OwnerChanged<u32>| tx.send(e.new).unwrap());

        raw.publish("{ definitely not an envelope").unwrap();
        raw.publish(r#"{"name":"stats:hp","origin":"x","body":{"kind":"owner_changed","payload":{"owner":"00000000-0000-0000-0000-000000000000","old":"bad","new":1}}}"#)
            .unwrap();
        let owner = OwnerId::new();
        a.fire_owner_changed(&hp, &OwnerChanged { owner, old: 20, new: 0 }).unwrap();
        a.fire_owner_changed(&hp, &OwnerChanged { owner, old: 0, new: 5 }).unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), 5);
    }

    #[test]
    fn publish_failure_surfaces_after_local_delivery() {
        let channel = MemoryChannel::new("closed");
        let a = node(&channel, "a");
        let xp = field("stats", "xp", 0u64).owner();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        a.on_owner_changed(&xp, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        a.shutdown();
        let result = a.fire_owner_changed(&xp, &OwnerChanged { owner: OwnerId::new(), old: 0, new: 1 });
        assert!(matches!(result, Err(EventError::Publish(_))));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn expiry_events_cross_nodes() {
        let channel = MemoryChannel::new("expiry");
        let a = node(&channel, "a");
        let b = node(&channel, "b");
        let boost = field("boost", "xp", 2u32)
            .expires_after(Duration::from_secs(60))
            .owner();
        let (tx, rx) = mpsc::channel();
        b.on_owner_expired(&boost, move |e: &OwnerExpired<u32>| tx.send(e.clone()).unwrap());

        let event = OwnerExpired { owner: OwnerId::new(), value: 3 };
        a.fire_owner_expired(&boost, &event).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), event);
    }
}
