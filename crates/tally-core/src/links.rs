use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;

use tally_types::{LinkKey, LinkType, OwnerId};

use crate::key::SharedKey;

struct LinkedKey {
    shared: SharedKey,
    key: Arc<dyn Any + Send + Sync>,
}

/// Bidirectional owner ↔ shared-entity index.
///
/// Forward: `(owner, link type) → key`, at most one key per pair. Reverse:
/// `(link type, key) → owners`. An owner is in a key's reverse set exactly
/// when its forward entry points at that key. Relinking moves the owner out
/// of the previous key's set.
///
/// Mutations of one owner are atomic with respect to each other: both maps
/// are updated while the owner's forward entry is held.
#[derive(Default)]
pub struct LinkRegistry {
    forward: DashMap<OwnerId, HashMap<Arc<str>, LinkedKey>>,
    reverse: DashMap<SharedKey, BTreeSet<OwnerId>>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link `owner` to `key`, returning the key it was linked to before.
    pub fn link<K: LinkKey>(&self, owner: OwnerId, link: &LinkType<K>, key: K) -> Option<K> {
        let shared = SharedKey::of(link, &key);
        let mut links = self.forward.entry(owner).or_default();
        let previous = links.insert(
            link.name_arc(),
            LinkedKey {
                shared: shared.clone(),
                key: Arc::new(key),
            },
        );

        if let Some(previous) = &previous {
            if previous.shared != shared {
                self.remove_reverse(&previous.shared, owner);
            }
        }
        self.reverse.entry(shared).or_default().insert(owner);

        previous.and_then(|p| downcast::<K>(link, &p))
    }

    /// Remove the link of this type, returning the key it pointed at.
    pub fn unlink<K: LinkKey>(&self, owner: OwnerId, link: &LinkType<K>) -> Option<K> {
        let previous = {
            let mut links = self.forward.get_mut(&owner)?;
            let previous = links.remove(link.name())?;
            self.remove_reverse(&previous.shared, owner);
            previous
        };
        self.forward.remove_if(&owner, |_, links| links.is_empty());
        downcast::<K>(link, &previous)
    }

    /// Current key for `(owner, link)`. Reads the forward map only.
    pub fn resolve<K: LinkKey>(&self, owner: OwnerId, link: &LinkType<K>) -> Option<K> {
        let links = self.forward.get(&owner)?;
        let linked = links.get(link.name())?;
        downcast::<K>(link, linked)
    }

    /// Current shared entity for `(owner, link name)`, type erased.
    pub fn resolve_shared(&self, owner: OwnerId, link: &str) -> Option<SharedKey> {
        let links = self.forward.get(&owner)?;
        links.get(link).map(|linked| linked.shared.clone())
    }

    /// Owners currently linked to `key`.
    pub fn affected<K: LinkKey>(&self, link: &LinkType<K>, key: &K) -> BTreeSet<OwnerId> {
        self.affected_shared(&SharedKey::of(link, key))
    }

    pub fn affected_shared(&self, shared: &SharedKey) -> BTreeSet<OwnerId> {
        self.reverse
            .get(shared)
            .map(|owners| owners.clone())
            .unwrap_or_default()
    }

    /// Every shared entity `owner` is linked to.
    pub fn links_of(&self, owner: OwnerId) -> Vec<SharedKey> {
        self.forward
            .get(&owner)
            .map(|links| links.values().map(|l| l.shared.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of `(owner, link type)` pairs.
    pub fn len(&self) -> usize {
        self.forward.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    fn remove_reverse(&self, shared: &SharedKey, owner: OwnerId) {
        if let Some(mut owners) = self.reverse.get_mut(shared) {
            owners.remove(&owner);
        }
        self.reverse.remove_if(shared, |_, owners| owners.is_empty());
    }
}

fn downcast<K: LinkKey>(link: &LinkType<K>, linked: &LinkedKey) -> Option<K> {
    let key = linked.key.downcast_ref::<K>().cloned();
    if key.is_none() {
        warn!(link = link.name(), "link type name reused with a different key type");
    }
    key
}

impl std::fmt::Debug for LinkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkRegistry")
            .field("links", &self.len())
            .field("shared_entities", &self.reverse.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn island() -> LinkType<String> {
        LinkType::serde("island")
    }

    #[test]
    fn link_resolve_unlink() {
        let registry = LinkRegistry::new();
        let island = island();
        let owner = OwnerId::new();

        assert_eq!(registry.link(owner, &island, "a".to_string()), None);
        assert_eq!(registry.resolve(owner, &island), Some("a".to_string()));
        assert_eq!(registry.affected(&island, &"a".to_string()), BTreeSet::from([owner]));

        assert_eq!(registry.unlink(owner, &island), Some("a".to_string()));
        assert_eq!(registry.resolve(owner, &island), None);
        assert!(registry.affected(&island, &"a".to_string()).is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn unlink_without_link_is_none() {
        let registry = LinkRegistry::new();
        assert_eq!(registry.unlink(OwnerId::new(), &island()), None);
    }

    #[test]
    fn relink_moves_owner_between_keys() {
        let registry = LinkRegistry::new();
        let island = island();
        let owner = OwnerId::new();
        registry.link(owner, &island, "a".to_string());
        let previous = registry.link(owner, &island, "b".to_string());

        assert_eq!(previous, Some("a".to_string()));
        assert!(registry.affected(&island, &"a".to_string()).is_empty());
        assert_eq!(registry.affected(&island, &"b".to_string()), BTreeSet::from([owner]));
    }

    #[test]
    fn link_types_are_independent() {
        let registry = LinkRegistry::new();
        let island = island();
        let guild = LinkType::<String>::serde("guild");
        let owner = OwnerId::new();
        registry.link(owner, &island, "x".to_string());
        registry.link(owner, &guild, "x".to_string());

        assert_eq!(registry.len(), 2);
        registry.unlink(owner, &guild);
        assert_eq!(registry.resolve(owner, &island), Some("x".to_string()));
        assert_eq!(registry.resolve_shared(owner, "island"), Some(SharedKey::new("island", "x")));
        assert_eq!(registry.links_of(owner), vec![SharedKey::new("island", "x")]);
    }

    #[test]
    fn many_owners_share_a_key() {
        let registry = LinkRegistry::new();
        let island = island();
        let owners: Vec<OwnerId> = (0..5).map(|_| OwnerId::new()).collect();
        for owner in &owners {
            registry.link(*owner, &island, "home".to_string());
        }
        assert_eq!(registry.affected(&island, &"home".to_string()).len(), 5);
        registry.unlink(owners[0], &island);
        assert_eq!(registry.affected(&island, &"home".to_string()).len(), 4);
    }

    #[test]
    fn concurrent_links_keep_reverse_index() {
        let registry = Arc::new(LinkRegistry::new());
        let island = island();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                let island = island.clone();
                std::thread::spawn(move || {
                    let owner = OwnerId::new();
                    for i in 0..50 {
                        registry.link(owner, &island, format!("k{}", (t + i) % 3));
                    }
                    owner
                })
            })
            .collect();
        let owners: Vec<OwnerId> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let total: usize = (0..3)
            .map(|k| registry.affected(&island, &format!("k{k}")).len())
            .sum();
        assert_eq!(total, owners.len());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Link(usize, u8),
        Unlink(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..4usize, 0..3u8).prop_map(|(o, k)| Op::Link(o, k)),
            (0..4usize).prop_map(Op::Unlink),
        ]
    }

    proptest! {
        #[test]
        fn forward_and_reverse_agree(ops in proptest::collection::vec(op(), 0..64)) {
            let registry = LinkRegistry::new();
            let island = island();
            let owners: Vec<OwnerId> = (0..4).map(|_| OwnerId::new()).collect();

            for op in ops {
                match op {
                    Op::Link(o, k) => { registry.link(owners[o], &island, k.to_string()); }
                    Op::Unlink(o) => { registry.unlink(owners[o], &island); }
                }
            }

            for k in 0..3u8 {
                let key = k.to_string();
                for owner in &owners {
                    let in_reverse = registry.affected(&island, &key).contains(owner);
                    let forward = registry.resolve(*owner, &island);
                    prop_assert_eq!(in_reverse, forward.as_deref() == Some(key.as_str()));
                }
            }
        }
    }
}
