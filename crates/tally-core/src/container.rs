use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tally_codec::{DataFormat, Record};
use tally_types::{FieldSpec, FieldValue};

use crate::error::{DataError, DataResult};

struct Slot {
    value: Arc<dyn Any + Send + Sync>,
    raw: Vec<u8>,
}

/// The cached fields of one entity.
///
/// Fields are resolved one at a time. A resolved field is either held as a
/// decoded value (with its encoded bytes, ready for persisting) or known to
/// be absent from storage. Raw entries from storage that no one has asked
/// for yet are kept undecoded so that writing the container back never
/// drops them.
pub struct EntityContainer {
    format: DataFormat,
    slots: HashMap<Arc<str>, Slot>,
    absent: HashSet<Arc<str>>,
    unloaded: Record,
}

impl EntityContainer {
    pub fn new(format: DataFormat) -> Self {
        Self {
            format,
            slots: HashMap::new(),
            absent: HashSet::new(),
            unloaded: Record::new(),
        }
    }

    pub fn format(&self) -> DataFormat {
        self.format
    }

    pub fn is_resolved(&self, full_key: &str) -> bool {
        self.slots.contains_key(full_key) || self.absent.contains(full_key)
    }

    /// Number of fields held as decoded values.
    pub fn loaded_count(&self) -> usize {
        self.slots.len()
    }

    /// Take in a freshly loaded record. Entries for fields already resolved
    /// are ignored: the cache is authoritative for them.
    pub fn absorb(&mut self, record: Record) {
        for (key, raw) in record {
            if !self.is_resolved(&key) {
                self.unloaded.insert(key, raw);
            }
        }
    }

    /// The cached value, if the field is resolved.
    pub fn cached<T: FieldValue>(&self, spec: &FieldSpec<T>) -> DataResult<Option<T>> {
        if let Some(slot) = self.slots.get(spec.full_key()) {
            return slot
                .value
                .downcast_ref::<T>()
                .cloned()
                .map(Some)
                .ok_or_else(|| DataError::TypeMismatch {
                    field: spec.full_key().to_string(),
                });
        }
        if self.absent.contains(spec.full_key()) {
            return Ok(Some(spec.default_value()));
        }
        Ok(None)
    }

    /// Resolve a field from the absorbed raw entries, falling back to the
    /// default when storage has nothing for it.
    pub fn resolve<T: FieldValue>(&mut self, spec: &FieldSpec<T>) -> DataResult<T> {
        if let Some(value) = self.cached(spec)? {
            return Ok(value);
        }
        match self.unloaded.remove(spec.full_key()) {
            Some(raw) => {
                let value = match spec.decode(&raw, self.format) {
                    Ok(value) => value,
                    Err(e) => {
                        // Keep the bytes so a later save does not erase them.
                        self.unloaded.insert(spec.full_key().to_string(), raw);
                        return Err(e.into());
                    }
                };
                self.slots.insert(
                    spec.full_key_arc(),
                    Slot {
                        value: Arc::new(value.clone()),
                        raw,
                    },
                );
                Ok(value)
            }
            None => {
                self.absent.insert(spec.full_key_arc());
                Ok(spec.default_value())
            }
        }
    }

    /// Replace a field's value. Encoding happens here, so a codec failure
    /// leaves the container unchanged.
    pub fn put<T: FieldValue>(&mut self, spec: &FieldSpec<T>, value: T) -> DataResult<()> {
        let raw = spec.encode(&value, self.format)?;
        let key = spec.full_key_arc();
        self.absent.remove(&key);
        self.unloaded.remove(&*key);
        self.slots.insert(
            key,
            Slot {
                value: Arc::new(value),
                raw,
            },
        );
        Ok(())
    }

    /// All known fields as a storage record.
    pub fn to_record(&self) -> Record {
        let mut record = self.unloaded.clone();
        for (key, slot) in &self.slots {
            record.insert(key.to_string(), slot.raw.clone());
        }
        record
    }

    pub fn encode(&self) -> DataResult<Vec<u8>> {
        Ok(self.format.encode_record(&self.to_record())?)
    }
}

impl std::fmt::Debug for EntityContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityContainer")
            .field("format", &self.format)
            .field("loaded", &self.slots.len())
            .field("absent", &self.absent.len())
            .field("unloaded", &self.unloaded.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_types::field;

    #[test]
    fn unresolved_field_has_no_cached_value() {
        let coins = field("economy", "coins", 0i64).owner();
        let container = EntityContainer::new(DataFormat::Json);
        assert!(container.cached(&coins).unwrap().is_none());
        assert!(!container.is_resolved("economy:coins"));
    }

    #[test]
    fn resolve_decodes_absorbed_entries() {
        let coins = field("economy", "coins", 0i64).owner();
        let mut record = Record::new();
        record.insert("economy:coins".into(), b"250".to_vec());

        let mut container = EntityContainer::new(DataFormat::Json);
        container.absorb(record);
        assert_eq!(container.resolve(&coins).unwrap(), 250);
        assert_eq!(container.cached(&coins).unwrap(), Some(250));
    }

    #[test]
    fn missing_entry_resolves_to_default_once() {
        let name = field("profile", "name", "Steve".to_string()).owner();
        let mut container = EntityContainer::new(DataFormat::Json);
        assert_eq!(container.resolve(&name).unwrap(), "Steve");
        assert!(container.is_resolved("profile:name"));

        // A later load must not override a resolved field.
        let mut record = Record::new();
        record.insert("profile:name".into(), br#""Alex""#.to_vec());
        container.absorb(record);
        assert_eq!(container.resolve(&name).unwrap(), "Steve");
    }

    #[test]
    fn to_record_keeps_unrequested_fields() {
        let coins = field("economy", "coins", 0i64).owner();
        let mut record = Record::new();
        record.insert("economy:coins".into(), b"1".to_vec());
        record.insert("stats:kills".into(), b"9".to_vec());

        let mut container = EntityContainer::new(DataFormat::Json);
        container.absorb(record);
        container.put(&coins, 2).unwrap();

        let out = container.to_record();
        assert_eq!(out["economy:coins"], b"2");
        assert_eq!(out["stats:kills"], b"9");
    }

    #[test]
    fn put_then_cached() {
        let level = field("stats", "level", 1u32).owner();
        let mut container = EntityContainer::new(DataFormat::Binary);
        container.put(&level, 5).unwrap();
        assert_eq!(container.cached(&level).unwrap(), Some(5));
        let bytes = container.encode().unwrap();
        let record = DataFormat::Binary.decode_record(&bytes).unwrap();
        assert_eq!(level.decode(&record["stats:level"], DataFormat::Binary).unwrap(), 5);
    }

    #[test]
    fn type_mismatch_is_reported() {
        let as_int = field("x", "y", 0i64).owner();
        let as_text = field("x", "y", String::new()).owner();
        let mut container = EntityContainer::new(DataFormat::Json);
        container.put(&as_int, 3).unwrap();
        assert!(matches!(
            container.cached(&as_text),
            Err(DataError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn corrupt_entry_is_a_codec_error() {
        let coins = field("economy", "coins", 0i64).owner();
        let mut record = Record::new();
        record.insert("economy:coins".into(), b"\"text\"".to_vec());
        let mut container = EntityContainer::new(DataFormat::Json);
        container.absorb(record);
        assert!(matches!(container.resolve(&coins), Err(DataError::Codec(_))));
        assert_eq!(container.to_record()["economy:coins"], b"\"text\"");
    }
}
