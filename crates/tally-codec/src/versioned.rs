use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::codec::Codec;
use crate::error::{CodecError, CodecResult};
use crate::format::DataFormat;

const VERSION_KEY: &str = "_version";
const DATA_KEY: &str = "data";

type Migration<T> = Arc<dyn Fn(T) -> T + Send + Sync>;

/// A codec that stamps payloads with a schema version.
///
/// Writes always use the current codec. Reads dispatch on the stored
/// version: the current codec for the current version, a registered legacy
/// codec otherwise, followed by every step migration from the stored
/// version up to the current one. Missing steps are skipped.
///
/// JSON payloads are wrapped as `{"_version": n, "data": ...}`; a JSON
/// payload without the wrapper is read as the current version. Binary
/// payloads are a bincode `(u32, bytes)` pair.
pub struct VersionedCodec<T> {
    current_version: u32,
    current: Arc<dyn Codec<T>>,
    legacy: BTreeMap<u32, Arc<dyn Codec<T>>>,
    migrations: BTreeMap<u32, Migration<T>>,
}

impl<T> VersionedCodec<T> {
    pub fn builder(current_version: u32, current: Arc<dyn Codec<T>>) -> VersionedCodecBuilder<T> {
        VersionedCodecBuilder {
            codec: VersionedCodec {
                current_version,
                current,
                legacy: BTreeMap::new(),
                migrations: BTreeMap::new(),
            },
        }
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    /// Decode bytes written at a known version, migrating up to current.
    pub fn decode_at(&self, bytes: &[u8], version: u32, format: DataFormat) -> CodecResult<T> {
        let mut value = if version == self.current_version {
            self.current.decode(bytes, format)?
        } else {
            let reader = self.legacy.get(&version).ok_or(CodecError::UnknownVersion {
                version,
                current: self.current_version,
            })?;
            reader.decode(bytes, format)?
        };

        for step in version..self.current_version {
            if let Some(migration) = self.migrations.get(&step) {
                debug!(from = step, to = step + 1, "migrating versioned value");
                value = migration(value);
            }
        }
        Ok(value)
    }
}

impl<T> Codec<T> for VersionedCodec<T> {
    fn encode(&self, value: &T, format: DataFormat) -> CodecResult<Vec<u8>> {
        let inner = self.current.encode(value, format)?;
        match format {
            DataFormat::Json => {
                let data: Value = serde_json::from_slice(&inner)?;
                let wrapped = serde_json::json!({
                    VERSION_KEY: self.current_version,
                    DATA_KEY: data,
                });
                Ok(serde_json::to_vec(&wrapped)?)
            }
            DataFormat::Binary => Ok(bincode::serialize(&(self.current_version, inner))?),
        }
    }

    fn decode(&self, bytes: &[u8], format: DataFormat) -> CodecResult<T> {
        match format {
            DataFormat::Json => {
                let value: Value = serde_json::from_slice(bytes)?;
                match value {
                    Value::Object(mut object) if object.contains_key(VERSION_KEY) => {
                        let version = object
                            .get(VERSION_KEY)
                            .and_then(Value::as_u64)
                            .and_then(|v| u32::try_from(v).ok())
                            .ok_or_else(|| CodecError::Malformed("bad _version".into()))?;
                        let data = object.remove(DATA_KEY).unwrap_or(Value::Null);
                        self.decode_at(&serde_json::to_vec(&data)?, version, format)
                    }
                    _ => self.decode_at(bytes, self.current_version, format),
                }
            }
            DataFormat::Binary => {
                let (version, inner): (u32, Vec<u8>) = bincode::deserialize(bytes)?;
                self.decode_at(&inner, version, format)
            }
        }
    }
}

/// Builder for [`VersionedCodec`].
pub struct VersionedCodecBuilder<T> {
    codec: VersionedCodec<T>,
}

impl<T> VersionedCodecBuilder<T> {
    /// Register the codec that reads payloads written at `version`.
    pub fn legacy(mut self, version: u32, reader: Arc<dyn Codec<T>>) -> Self {
        self.codec.legacy.insert(version, reader);
        self
    }

    /// Register the migration from `from` to `from + 1`.
    pub fn migrate(mut self, from: u32, migration: impl Fn(T) -> T + Send + Sync + 'static) -> Self {
        self.codec.migrations.insert(from, Arc::new(migration));
        self
    }

    pub fn build(self) -> VersionedCodec<T> {
        self.codec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::serde_codec;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ProfileV1 {
        name: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        level: u32,
    }

    /// Reads a v1 payload into the current shape.
    struct V1Reader;

    impl Codec<Profile> for V1Reader {
        fn encode(&self, value: &Profile, format: DataFormat) -> CodecResult<Vec<u8>> {
            format.encode_value(&ProfileV1 {
                name: value.name.clone(),
            })
        }

        fn decode(&self, bytes: &[u8], format: DataFormat) -> CodecResult<Profile> {
            let old: ProfileV1 = format.decode_value(bytes)?;
            Ok(Profile {
                name: old.name,
                level: 0,
            })
        }
    }

    fn codec() -> VersionedCodec<Profile> {
        VersionedCodec::builder(3, serde_codec::<Profile>())
            .legacy(1, Arc::new(V1Reader))
            .migrate(1, |mut p| {
                p.level = 1;
                p
            })
            .migrate(2, |mut p| {
                p.level *= 10;
                p
            })
            .build()
    }

    #[test]
    fn current_version_in_both_formats() {
        let codec = codec();
        let profile = Profile {
            name: "alex".into(),
            level: 4,
        };
        for format in [DataFormat::Json, DataFormat::Binary] {
            let bytes = codec.encode(&profile, format).unwrap();
            assert_eq!(codec.decode(&bytes, format).unwrap(), profile);
        }
    }

    #[test]
    fn json_wrapper_carries_version() {
        let bytes = codec()
            .encode(&Profile { name: "a".into(), level: 1 }, DataFormat::Json)
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["_version"], 3);
        assert_eq!(value["data"]["name"], "a");
    }

    #[test]
    fn legacy_payload_is_migrated_stepwise() {
        let stored = br#"{"_version":1,"data":{"name":"old"}}"#;
        let profile = codec().decode(stored, DataFormat::Json).unwrap();
        assert_eq!(profile, Profile { name: "old".into(), level: 10 });

        let binary = bincode::serialize(&(1u32, bincode::serialize(&ProfileV1 { name: "bin".into() }).unwrap())).unwrap();
        let profile = codec().decode(&binary, DataFormat::Binary).unwrap();
        assert_eq!(profile.level, 10);
    }

    #[test]
    fn unwrapped_json_is_current_version() {
        let profile = codec().decode(br#"{"name":"raw","level":2}"#, DataFormat::Json).unwrap();
        assert_eq!(profile.level, 2);
    }

    #[test]
    fn unknown_version_is_an_error() {
        let stored = br#"{"_version":2,"data":{"name":"x"}}"#;
        assert!(matches!(
            codec().decode(stored, DataFormat::Json),
            Err(CodecError::UnknownVersion { version: 2, current: 3 })
        ));
    }
}
