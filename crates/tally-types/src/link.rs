use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tally_codec::{serde_codec, Codec, OptionCodec};

use crate::field::{FieldBuilder, OwnerField};

/// Key of a shared entity.
///
/// `Display` yields the storage id; `FromStr` parses it back for scans.
pub trait LinkKey: Clone + Eq + Hash + fmt::Debug + fmt::Display + FromStr + Send + Sync + 'static {}

impl<K> LinkKey for K where
    K: Clone + Eq + Hash + fmt::Debug + fmt::Display + FromStr + Send + Sync + 'static
{
}

struct LinkTypeInner<K> {
    name: Arc<str>,
    key_codec: Arc<dyn Codec<K>>,
    back_ref: OwnerField<Option<K>>,
}

/// A named relation from owners to shared entities keyed by `K`.
///
/// Each owner has at most one key per link type. The current key is also
/// persisted on the owner through the back-reference field, so links can be
/// rebuilt after a restart. Two link types are equal when their names are.
pub struct LinkType<K> {
    inner: Arc<LinkTypeInner<K>>,
}

impl<K: LinkKey> LinkType<K> {
    pub fn new(
        name: impl Into<String>,
        key_codec: Arc<dyn Codec<K>>,
        back_ref: OwnerField<Option<K>>,
    ) -> Self {
        let name: String = name.into();
        Self {
            inner: Arc::new(LinkTypeInner {
                name: name.into(),
                key_codec,
                back_ref,
            }),
        }
    }

    /// Link type whose back-reference lives at `links:{name}`.
    pub fn with_codec(name: impl Into<String>, key_codec: Arc<dyn Codec<K>>) -> Self {
        let name: String = name.into();
        let back_ref = FieldBuilder::new(
            "links",
            name.clone(),
            Arc::new(OptionCodec::new(key_codec.clone())),
            None,
        )
        .owner();
        Self::new(name, key_codec, back_ref)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn name_arc(&self) -> Arc<str> {
        self.inner.name.clone()
    }

    pub fn key_codec(&self) -> &Arc<dyn Codec<K>> {
        &self.inner.key_codec
    }

    /// Owner field holding the owner's current key for this link type.
    pub fn back_ref(&self) -> &OwnerField<Option<K>> {
        &self.inner.back_ref
    }

    /// Record id of the shared entity for `key`.
    pub fn storage_id(&self, key: &K) -> String {
        key.to_string()
    }

    pub fn parse_id(&self, id: &str) -> Option<K> {
        id.parse().ok()
    }
}

impl<K> LinkType<K>
where
    K: LinkKey + Serialize + DeserializeOwned,
{
    /// Link type with serde-encoded keys.
    pub fn serde(name: impl Into<String>) -> Self {
        Self::with_codec(name, serde_codec::<K>())
    }
}

impl<K> Clone for LinkType<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> PartialEq for LinkType<K> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.name == other.inner.name
    }
}

impl<K> Eq for LinkType<K> {}

impl<K> fmt::Debug for LinkType<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LinkType({})", self.inner.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OwnerId;
    use tally_codec::DataFormat;

    #[test]
    fn back_ref_is_namespaced_under_links() {
        let island = LinkType::<OwnerId>::serde("island");
        assert_eq!(island.back_ref().full_key(), "links:island");
        assert_eq!(island.back_ref().default_value(), None);
    }

    #[test]
    fn storage_id_parses_back() {
        let island = LinkType::<OwnerId>::serde("island");
        let key = OwnerId::new();
        let id = island.storage_id(&key);
        assert_eq!(island.parse_id(&id), Some(key));
        assert_eq!(island.parse_id("nope"), None);
    }

    #[test]
    fn identity_is_the_name() {
        let a = LinkType::<String>::serde("guild");
        let b = LinkType::<String>::serde("guild");
        let c = LinkType::<String>::serde("island");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn back_ref_encodes_key() {
        let guild = LinkType::<String>::serde("guild");
        let bytes = guild
            .back_ref()
            .encode(&Some("red".into()), DataFormat::Json)
            .unwrap();
        assert_eq!(bytes, br#""red""#);
    }
}
