use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tally_codec::{Codec, DataFormat};
use tally_types::OwnerId;

use crate::error::{EventError, EventResult};
use crate::event::Topic;

/// Wire form of one event on the shared channel.
///
/// `name` is the field's full key (or link type name), `origin` the node
/// that fired it. Values and keys are embedded as the JSON their codecs
/// produce.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub name: String,
    pub origin: String,
    pub body: EnvelopeBody,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum EnvelopeBody {
    OwnerChanged {
        owner: OwnerId,
        old: Value,
        new: Value,
    },
    SharedChanged {
        key: Value,
        old: Value,
        new: Value,
        affected: BTreeSet<OwnerId>,
    },
    Linked {
        owner: OwnerId,
        key: Value,
    },
    Unlinked {
        owner: OwnerId,
        previous: Value,
    },
    OwnerExpired {
        owner: OwnerId,
        value: Value,
    },
    SharedExpired {
        key: Value,
        value: Value,
        members: BTreeSet<OwnerId>,
    },
}

impl EnvelopeBody {
    pub fn topic(&self) -> Topic {
        match self {
            Self::OwnerChanged { .. } => Topic::OwnerData,
            Self::SharedChanged { .. } => Topic::SharedData,
            Self::Linked { .. } | Self::Unlinked { .. } => Topic::Link,
            Self::OwnerExpired { .. } => Topic::OwnerExpired,
            Self::SharedExpired { .. } => Topic::SharedExpired,
        }
    }
}

impl Envelope {
    pub fn to_json(&self) -> EventResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> EventResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Encode a value with its codec and embed the JSON.
pub(crate) fn to_value<T>(codec: &dyn Codec<T>, value: &T) -> EventResult<Value> {
    let bytes = codec.encode(value, DataFormat::Json)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| EventError::Envelope(format!("codec produced non-json output: {e}")))
}

pub(crate) fn from_value<T>(codec: &dyn Codec<T>, value: &Value) -> EventResult<T> {
    let bytes = serde_json::to_vec(value)?;
    Ok(codec.decode(&bytes, DataFormat::Json)?)
}
