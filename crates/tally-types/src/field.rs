use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tally_codec::{serde_codec, Codec, CodecResult, DataFormat};

use crate::link::{LinkKey, LinkType};
use crate::validation::{ValidationError, ValidationResult, Validator};

/// Bound shared by every value a field can hold.
pub trait FieldValue: Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> FieldValue for T where T: Clone + fmt::Debug + Send + Sync + 'static {}

/// Capability tag of a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// Owner-keyed, never expires.
    Plain,
    /// Stored on a shared entity reached through a link.
    Linked,
    /// Owner-keyed with a default TTL.
    Expiring,
    /// Shared-entity field with a default TTL.
    ExpiringLinked,
}

impl FieldKind {
    pub fn is_linked(&self) -> bool {
        matches!(self, Self::Linked | Self::ExpiringLinked)
    }

    pub fn is_expiring(&self) -> bool {
        matches!(self, Self::Expiring | Self::ExpiringLinked)
    }
}

/// Immutable description of a field: identity, encoding, default and rules.
///
/// `full_key` is `namespace:key` and must be unique across the process; it
/// is the key the field's value is stored under inside an entity record.
pub struct FieldSpec<T> {
    namespace: String,
    key: String,
    full_key: Arc<str>,
    codec: Arc<dyn Codec<T>>,
    default: T,
    validator: Option<Validator<T>>,
    ttl: Option<Duration>,
}

impl<T: FieldValue> FieldSpec<T> {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn full_key(&self) -> &str {
        &self.full_key
    }

    /// Shared handle to the full key, used as a map key without allocating.
    pub fn full_key_arc(&self) -> Arc<str> {
        self.full_key.clone()
    }

    pub fn default_value(&self) -> T {
        self.default.clone()
    }

    pub fn codec(&self) -> &Arc<dyn Codec<T>> {
        &self.codec
    }

    /// Default TTL applied on writes. `Some` only for expiring fields.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn validate(&self, value: &T) -> Result<(), ValidationError> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };
        match validator(value) {
            ValidationResult::Valid => Ok(()),
            ValidationResult::Invalid(reason) => Err(ValidationError {
                field: self.full_key.to_string(),
                value: format!("{value:?}"),
                reason,
            }),
        }
    }

    pub fn encode(&self, value: &T, format: DataFormat) -> CodecResult<Vec<u8>> {
        self.codec.encode(value, format)
    }

    pub fn decode(&self, bytes: &[u8], format: DataFormat) -> CodecResult<T> {
        self.codec.decode(bytes, format)
    }
}

impl<T> fmt::Debug for FieldSpec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSpec")
            .field("full_key", &self.full_key)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// A field stored on the owner entity itself.
pub struct OwnerField<T> {
    spec: Arc<FieldSpec<T>>,
}

impl<T: FieldValue> OwnerField<T> {
    pub fn spec(&self) -> &Arc<FieldSpec<T>> {
        &self.spec
    }

    pub fn kind(&self) -> FieldKind {
        if self.spec.ttl.is_some() {
            FieldKind::Expiring
        } else {
            FieldKind::Plain
        }
    }
}

impl<T> Clone for OwnerField<T> {
    fn clone(&self) -> Self {
        Self {
            spec: self.spec.clone(),
        }
    }
}

impl<T> Deref for OwnerField<T> {
    type Target = FieldSpec<T>;

    fn deref(&self) -> &Self::Target {
        &self.spec
    }
}

impl<T> fmt::Debug for OwnerField<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerField({})", self.spec.full_key)
    }
}

/// A field stored on the shared entity an owner is linked to.
pub struct LinkedField<K, T> {
    spec: Arc<FieldSpec<T>>,
    link: LinkType<K>,
}

impl<K: LinkKey, T: FieldValue> LinkedField<K, T> {
    pub fn spec(&self) -> &Arc<FieldSpec<T>> {
        &self.spec
    }

    pub fn link_type(&self) -> &LinkType<K> {
        &self.link
    }

    pub fn kind(&self) -> FieldKind {
        if self.spec.ttl.is_some() {
            FieldKind::ExpiringLinked
        } else {
            FieldKind::Linked
        }
    }
}

impl<K, T> Clone for LinkedField<K, T> {
    fn clone(&self) -> Self {
        Self {
            spec: self.spec.clone(),
            link: self.link.clone(),
        }
    }
}

impl<K, T> Deref for LinkedField<K, T> {
    type Target = FieldSpec<T>;

    fn deref(&self) -> &Self::Target {
        &self.spec
    }
}

impl<K: LinkKey, T> fmt::Debug for LinkedField<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LinkedField({} via {})", self.spec.full_key, self.link.name())
    }
}

/// Declares a field. Finish with [`FieldBuilder::owner`] or
/// [`FieldBuilder::linked`].
pub struct FieldBuilder<T> {
    namespace: String,
    key: String,
    codec: Arc<dyn Codec<T>>,
    default: T,
    validator: Option<Validator<T>>,
    ttl: Option<Duration>,
}

impl<T: FieldValue> FieldBuilder<T> {
    pub fn new(
        namespace: impl Into<String>,
        key: impl Into<String>,
        codec: Arc<dyn Codec<T>>,
        default: T,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
            codec,
            default,
            validator: None,
            ttl: None,
        }
    }

    pub fn validator(mut self, validator: Validator<T>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn validate_with(
        self,
        check: impl Fn(&T) -> ValidationResult + Send + Sync + 'static,
    ) -> Self {
        self.validator(Arc::new(check))
    }

    /// Makes the field expiring with the given default TTL.
    pub fn expires_after(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    fn into_spec(self) -> Arc<FieldSpec<T>> {
        let full_key: Arc<str> = format!("{}:{}", self.namespace, self.key).into();
        Arc::new(FieldSpec {
            namespace: self.namespace,
            key: self.key,
            full_key,
            codec: self.codec,
            default: self.default,
            validator: self.validator,
            ttl: self.ttl,
        })
    }

    pub fn owner(self) -> OwnerField<T> {
        OwnerField {
            spec: self.into_spec(),
        }
    }

    pub fn linked<K: LinkKey>(self, link: &LinkType<K>) -> LinkedField<K, T> {
        LinkedField {
            spec: self.into_spec(),
            link: link.clone(),
        }
    }
}

/// Starts a field backed by [`tally_codec::SerdeCodec`].
pub fn field<T>(namespace: impl Into<String>, key: impl Into<String>, default: T) -> FieldBuilder<T>
where
    T: FieldValue + Serialize + DeserializeOwned,
{
    FieldBuilder::new(namespace, key, serde_codec::<T>(), default)
}
