use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, CodecResult};

/// The encoded fields of one entity, keyed by full field key.
///
/// Values are opaque bytes produced by each field's codec in the record's
/// format. Lookup is always by key, never by position.
pub type Record = BTreeMap<String, Vec<u8>>;

/// Wire format for values and records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    /// Human-readable JSON. Records are JSON objects.
    #[default]
    Json,
    /// Compact bincode.
    Binary,
}

impl DataFormat {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Binary => "binary",
        }
    }

    /// Encode a single serde value.
    pub fn encode_value<T: Serialize + ?Sized>(&self, value: &T) -> CodecResult<Vec<u8>> {
        match self {
            Self::Json => Ok(serde_json::to_vec(value)?),
            Self::Binary => Ok(bincode::serialize(value)?),
        }
    }

    /// Decode a single serde value.
    pub fn decode_value<T: DeserializeOwned>(&self, bytes: &[u8]) -> CodecResult<T> {
        match self {
            Self::Json => Ok(serde_json::from_slice(bytes)?),
            Self::Binary => Ok(bincode::deserialize(bytes)?),
        }
    }

    /// Frame a whole record.
    ///
    /// In JSON every value must itself be JSON; it is embedded as a nested
    /// value so the stored file stays readable.
    pub fn encode_record(&self, record: &Record) -> CodecResult<Vec<u8>> {
        match self {
            Self::Json => {
                let mut object = serde_json::Map::with_capacity(record.len());
                for (key, bytes) in record {
                    let value: serde_json::Value = serde_json::from_slice(bytes).map_err(|e| {
                        CodecError::Malformed(format!("field {key} is not json: {e}"))
                    })?;
                    object.insert(key.clone(), value);
                }
                Ok(serde_json::to_vec_pretty(&serde_json::Value::Object(object))?)
            }
            Self::Binary => Ok(bincode::serialize(record)?),
        }
    }

    /// Parse a record. Empty input is an empty record.
    pub fn decode_record(&self, bytes: &[u8]) -> CodecResult<Record> {
        if bytes.is_empty() {
            return Ok(Record::new());
        }
        match self {
            Self::Json => {
                let value: serde_json::Value = serde_json::from_slice(bytes)?;
                let serde_json::Value::Object(object) = value else {
                    return Err(CodecError::Malformed("record is not a json object".into()));
                };
                let mut record = Record::new();
                for (key, value) in object {
                    record.insert(key, serde_json::to_vec(&value)?);
                }
                Ok(record)
            }
            Self::Binary => Ok(bincode::deserialize(bytes)?),
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataFormat {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "binary" | "bin" => Ok(Self::Binary),
            other => Err(CodecError::Malformed(format!("unknown data format: {other}"))),
        }
    }
}
