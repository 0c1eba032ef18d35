use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::warn;

use tally_types::{FieldValue, LinkKey, LinkType, LinkedField, OwnerField};

use crate::event::{LinkChange, OwnerChanged, OwnerExpired, SharedChanged, SharedExpired, Topic};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;
type ErasedListener = Arc<dyn Any + Send + Sync>;

/// In-process listener registry.
///
/// Delivery is synchronous, on the firing thread, in registration order.
/// The registry lock is released before any listener runs, so listeners may
/// subscribe further listeners or fire events themselves.
pub struct EventBus {
    listeners: RwLock<HashMap<Topic, HashMap<Arc<str>, Vec<ErasedListener>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Register a listener for events of type `E` under `(topic, name)`.
    pub fn subscribe<E: 'static>(
        &self,
        topic: Topic,
        name: &str,
        listener: impl Fn(&E) + Send + Sync + 'static,
    ) {
        let listener: Listener<E> = Arc::new(listener);
        let erased: ErasedListener = Arc::new(listener);
        let mut map = self.listeners.write().expect("lock poisoned");
        map.entry(topic)
            .or_default()
            .entry(Arc::from(name))
            .or_default()
            .push(erased);
    }

    /// Deliver `event` to every listener under `(topic, name)`.
    ///
    /// Returns the number of listeners invoked.
    pub fn fire<E: 'static>(&self, topic: Topic, name: &str, event: &E) -> usize {
        let snapshot: Vec<ErasedListener> = {
            let map = self.listeners.read().expect("lock poisoned");
            match map.get(&topic).and_then(|m| m.get(name)) {
                Some(list) => list.clone(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for erased in &snapshot {
            match erased.downcast_ref::<Listener<E>>() {
                Some(listener) => {
                    listener(event);
                    delivered += 1;
                }
                None => warn!(?topic, name, "listener registered for a different value type"),
            }
        }
        delivered
    }

    pub fn has_listeners(&self, topic: Topic, name: &str) -> bool {
        let map = self.listeners.read().expect("lock poisoned");
        map.get(&topic)
            .and_then(|m| m.get(name))
            .is_some_and(|list| !list.is_empty())
    }

    pub fn listener_count(&self) -> usize {
        let map = self.listeners.read().expect("lock poisoned");
        map.values().flat_map(HashMap::values).map(Vec::len).sum()
    }

    pub fn clear(&self) {
        self.listeners.write().expect("lock poisoned").clear();
    }

    // ---- typed subscriptions ----

    pub fn on_owner_changed<T: FieldValue>(
        &self,
        field: &OwnerField<T>,
        listener: impl Fn(&OwnerChanged<T>) + Send + Sync + 'static,
    ) {
        self.subscribe(Topic::OwnerData, field.full_key(), listener);
    }

    pub fn on_shared_changed<K: LinkKey, T: FieldValue>(
        &self,
        field: &LinkedField<K, T>,
        listener: impl Fn(&SharedChanged<K, T>) + Send + Sync + 'static,
    ) {
        self.subscribe(Topic::SharedData, field.full_key(), listener);
    }

    pub fn on_link_change<K: LinkKey>(
        &self,
        link: &LinkType<K>,
        listener: impl Fn(&LinkChange<K>) + Send + Sync + 'static,
    ) {
        self.subscribe(Topic::Link, link.name(), listener);
    }

    pub fn on_owner_expired<T: FieldValue>(
        &self,
        field: &OwnerField<T>,
        listener: impl Fn(&OwnerExpired<T>) + Send + Sync + 'static,
    ) {
        self.subscribe(Topic::OwnerExpired, field.full_key(), listener);
    }

    pub fn on_shared_expired<K: LinkKey, T: FieldValue>(
        &self,
        field: &LinkedField<K, T>,
        listener: impl Fn(&SharedExpired<K, T>) + Send + Sync + 'static,
    ) {
        self.subscribe(Topic::SharedExpired, field.full_key(), listener);
    }

    // ---- typed delivery ----

    pub fn fire_owner_changed<T: FieldValue>(&self, field: &OwnerField<T>, event: &OwnerChanged<T>) {
        self.fire(Topic::OwnerData, field.full_key(), event);
    }

    pub fn fire_shared_changed<K: LinkKey, T: FieldValue>(
        &self,
        field: &LinkedField<K, T>,
        event: &SharedChanged<K, T>,
    ) {
        self.fire(Topic::SharedData, field.full_key(), event);
    }

    pub fn fire_link_change<K: LinkKey>(&self, link: &LinkType<K>, event: &LinkChange<K>) {
        self.fire(Topic::Link, link.name(), event);
    }

    pub fn fire_owner_expired<T: FieldValue>(&self, field: &OwnerField<T>, event: &OwnerExpired<T>) {
        self.fire(Topic::OwnerExpired, field.full_key(), event);
    }

    pub fn fire_shared_expired<K: LinkKey, T: FieldValue>(
        &self,
        field: &LinkedField<K, T>,
        event: &SharedExpired<K, T>,
    ) {
        self.fire(Topic::SharedExpired, field.full_key(), event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listener_count", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tally_types::{field, OwnerId};

    #[test]
    fn delivers_in_registration_order() {
        let bus = EventBus::new();
        let coins = field("economy", "coins", 0i64).owner();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            bus.on_owner_changed(&coins, move |e: &OwnerChanged<i64>| {
                seen.lock().unwrap().push((tag, e.new));
            });
        }

        let owner = OwnerId::new();
        bus.fire_owner_changed(&coins, &OwnerChanged { owner, old: 0, new: 5 });
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("first", 5), ("second", 5), ("third", 5)]
        );
    }

    #[test]
    fn topics_and_names_are_isolated() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.subscribe(Topic::OwnerData, "a:b", move |_: &u32| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.fire(Topic::OwnerData, "a:c", &1u32), 0);
        assert_eq!(bus.fire(Topic::SharedData, "a:b", &1u32), 0);
        assert_eq!(bus.fire(Topic::OwnerData, "a:b", &1u32), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn mismatched_type_is_skipped() {
        let bus = EventBus::new();
        bus.subscribe(Topic::OwnerData, "k", |_: &u32| panic!("wrong listener"));
        assert_eq!(bus.fire(Topic::OwnerData, "k", &"text"), 0);
    }

    #[test]
    fn listener_may_subscribe_during_delivery() {
        let bus = Arc::new(EventBus::new());
        let inner = bus.clone();
        bus.subscribe(Topic::Link, "island", move |_: &u8| {
            inner.subscribe(Topic::Link, "island", |_: &u8| {});
        });
        assert_eq!(bus.fire(Topic::Link, "island", &0u8), 1);
        assert_eq!(bus.listener_count(), 2);
    }

    #[test]
    fn has_listeners_and_clear() {
        let bus = EventBus::new();
        assert!(!bus.has_listeners(Topic::OwnerExpired, "x:y"));
        bus.subscribe(Topic::OwnerExpired, "x:y", |_: &i32| {});
        assert!(bus.has_listeners(Topic::OwnerExpired, "x:y"));
        bus.clear();
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn concurrent_fire_and_subscribe() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.subscribe(Topic::OwnerData, "k", move |_: &u64| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let bus = bus.clone();
                std::thread::spawn(move || {
                    for i in 0..100u64 {
                        bus.fire(Topic::OwnerData, "k", &i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 400);
    }
}
