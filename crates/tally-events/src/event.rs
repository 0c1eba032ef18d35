use std::collections::BTreeSet;

use tally_types::OwnerId;

/// Listener registry partition. Listeners are keyed by topic plus a name:
/// the field's full key, or the link type's name for [`Topic::Link`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    OwnerData,
    SharedData,
    Link,
    OwnerExpired,
    SharedExpired,
}

/// An owner field changed value.
#[derive(Clone, Debug, PartialEq)]
pub struct OwnerChanged<T> {
    pub owner: OwnerId,
    pub old: T,
    pub new: T,
}

/// A shared-entity field changed value.
#[derive(Clone, Debug, PartialEq)]
pub struct SharedChanged<K, T> {
    pub key: K,
    pub old: T,
    pub new: T,
    /// Owners linked to `key` when the change was made.
    pub affected: BTreeSet<OwnerId>,
}

/// An owner was linked to or unlinked from a shared entity.
#[derive(Clone, Debug, PartialEq)]
pub enum LinkChange<K> {
    Linked { owner: OwnerId, key: K },
    Unlinked { owner: OwnerId, previous: K },
}

impl<K> LinkChange<K> {
    pub fn owner(&self) -> OwnerId {
        match self {
            Self::Linked { owner, .. } | Self::Unlinked { owner, .. } => *owner,
        }
    }
}

/// An expiring owner field lapsed. `value` is what it held until then.
#[derive(Clone, Debug, PartialEq)]
pub struct OwnerExpired<T> {
    pub owner: OwnerId,
    pub value: T,
}

/// An expiring shared field lapsed.
#[derive(Clone, Debug, PartialEq)]
pub struct SharedExpired<K, T> {
    pub key: K,
    pub value: T,
    pub members: BTreeSet<OwnerId>,
}
