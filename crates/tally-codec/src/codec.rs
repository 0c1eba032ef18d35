use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecResult;
use crate::format::DataFormat;

/// Converts values of `T` to and from bytes in a given [`DataFormat`].
///
/// Codecs are shared between fields, threads and the distributed event bus,
/// so they must be `Send + Sync`.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T, format: DataFormat) -> CodecResult<Vec<u8>>;

    fn decode(&self, bytes: &[u8], format: DataFormat) -> CodecResult<T>;
}

/// Codec for any serde-serializable type.
pub struct SerdeCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for SerdeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SerdeCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SerdeCodec<{}>", std::any::type_name::<T>())
    }
}

impl<T> Codec<T> for SerdeCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T, format: DataFormat) -> CodecResult<Vec<u8>> {
        format.encode_value(value)
    }

    fn decode(&self, bytes: &[u8], format: DataFormat) -> CodecResult<T> {
        format.decode_value(bytes)
    }
}

/// Shared [`SerdeCodec`] handle, the usual way fields are declared.
pub fn serde_codec<T>() -> Arc<dyn Codec<T>>
where
    T: Serialize + DeserializeOwned + 'static,
{
    Arc::new(SerdeCodec::<T>::new())
}

/// Lifts a codec over `Option<T>`.
///
/// JSON writes `null` for `None` and the inner encoding otherwise. Binary
/// writes a bincode `Option<bytes>`.
pub struct OptionCodec<T> {
    inner: Arc<dyn Codec<T>>,
}

impl<T> OptionCodec<T> {
    pub fn new(inner: Arc<dyn Codec<T>>) -> Self {
        Self { inner }
    }
}

impl<T> Codec<Option<T>> for OptionCodec<T> {
    fn encode(&self, value: &Option<T>, format: DataFormat) -> CodecResult<Vec<u8>> {
        match format {
            DataFormat::Json => match value {
                Some(v) => self.inner.encode(v, format),
                None => Ok(b"null".to_vec()),
            },
            DataFormat::Binary => {
                let inner = value
                    .as_ref()
                    .map(|v| self.inner.encode(v, format))
                    .transpose()?;
                format.encode_value(&inner)
            }
        }
    }

    fn decode(&self, bytes: &[u8], format: DataFormat) -> CodecResult<Option<T>> {
        match format {
            DataFormat::Json => {
                if bytes.trim_ascii() == b"null" {
                    Ok(None)
                } else {
                    self.inner.decode(bytes, format).map(Some)
                }
            }
            DataFormat::Binary => {
                let inner: Option<Vec<u8>> = format.decode_value(bytes)?;
                inner.map(|b| self.inner.decode(&b, format)).transpose()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Stats {
        kills: u32,
        deaths: u32,
    }

    #[test]
    fn serde_codec_in_both_formats() {
        let codec = serde_codec::<Stats>();
        let stats = Stats { kills: 7, deaths: 2 };
        for format in [DataFormat::Json, DataFormat::Binary] {
            let bytes = codec.encode(&stats, format).unwrap();
            assert_eq!(codec.decode(&bytes, format).unwrap(), stats);
        }
    }

    #[test]
    fn json_encoding_is_plain_json() {
        let codec = SerdeCodec::<Vec<String>>::new();
        let bytes = codec.encode(&vec!["a".into()], DataFormat::Json).unwrap();
        assert_eq!(bytes, br#"["a"]"#);
    }

    #[test]
    fn option_codec_wraps_inner() {
        let codec = OptionCodec::new(serde_codec::<String>());
        for format in [DataFormat::Json, DataFormat::Binary] {
            let some = codec.encode(&Some("isle".to_string()), format).unwrap();
            let none = codec.encode(&None, format).unwrap();
            assert_eq!(codec.decode(&some, format).unwrap().as_deref(), Some("isle"));
            assert_eq!(codec.decode(&none, format).unwrap(), None);
        }
        assert_eq!(codec.encode(&None, DataFormat::Json).unwrap(), b"null");
    }

    #[test]
    fn decode_garbage_fails() {
        let codec = SerdeCodec::<u64>::new();
        assert!(codec.decode(b"not a number", DataFormat::Json).is_err());
        assert!(codec.decode(&[1], DataFormat::Binary).is_err());
    }
}
