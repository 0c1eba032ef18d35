//! Value encodings for Tally.
//!
//! Every field value is turned into bytes by a [`Codec`] in one of two
//! [`DataFormat`]s. An entity's fields are persisted together as a
//! [`Record`]: a map from the field's full key to its encoded bytes, framed
//! by the same format.
//!
//! - [`SerdeCodec`] -- any `serde` type, JSON or bincode
//! - [`VersionedCodec`] -- wraps a codec with a schema version and migrates
//!   older payloads on read

pub mod codec;
pub mod error;
pub mod format;
pub mod versioned;

pub use codec::{serde_codec, Codec, OptionCodec, SerdeCodec};
pub use error::{CodecError, CodecResult};
pub use format::{DataFormat, Record};
pub use versioned::{VersionedCodec, VersionedCodecBuilder};
