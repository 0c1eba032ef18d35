use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use tally_types::{LinkKey, LinkType, OwnerId};

/// Storage bucket naming.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketLayout {
    /// Bucket holding one record per owner.
    pub owner_bucket: String,
    /// Shared entities of link type `t` live in `{linked_prefix}/{t}`.
    pub linked_prefix: String,
}

impl BucketLayout {
    pub fn shared_bucket(&self, link: &str) -> String {
        format!("{}/{}", self.linked_prefix, link)
    }
}

impl Default for BucketLayout {
    fn default() -> Self {
        Self {
            owner_bucket: "players".into(),
            linked_prefix: "linked".into(),
        }
    }
}

/// Key of a shared entity with its link type erased: the link type's name
/// plus the key's storage id.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SharedKey {
    link: Arc<str>,
    id: Arc<str>,
}

impl SharedKey {
    pub fn new(link: impl Into<Arc<str>>, id: impl Into<Arc<str>>) -> Self {
        Self {
            link: link.into(),
            id: id.into(),
        }
    }

    pub fn of<K: LinkKey>(link: &LinkType<K>, key: &K) -> Self {
        Self {
            link: link.name_arc(),
            id: link.storage_id(key).into(),
        }
    }

    pub fn link(&self) -> &str {
        &self.link
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.link, self.id)
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedKey({}:{})", self.link, self.id)
    }
}

/// The entity an expiration deadline belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExpiryScope {
    Owner(OwnerId),
    Shared(SharedKey),
}

impl fmt::Display for ExpiryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owner(owner) => write!(f, "owner:{owner}"),
            Self::Shared(key) => write!(f, "linked:{key}"),
        }
    }
}

/// Identity of an entity held by an [`EntityStore`](crate::EntityStore).
pub trait EntityKey: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Storage bucket of this entity's record.
    fn bucket(&self, layout: &BucketLayout) -> String;

    /// Storage id of this entity's record.
    fn record_id(&self) -> String;

    fn expiry_scope(&self) -> ExpiryScope;
}

impl EntityKey for OwnerId {
    fn bucket(&self, layout: &BucketLayout) -> String {
        layout.owner_bucket.clone()
    }

    fn record_id(&self) -> String {
        self.to_string()
    }

    fn expiry_scope(&self) -> ExpiryScope {
        ExpiryScope::Owner(*self)
    }
}

impl EntityKey for SharedKey {
    fn bucket(&self, layout: &BucketLayout) -> String {
        layout.shared_bucket(&self.link)
    }

    fn record_id(&self) -> String {
        self.id.to_string()
    }

    fn expiry_scope(&self) -> ExpiryScope {
        ExpiryScope::Shared(self.clone())
    }
}
