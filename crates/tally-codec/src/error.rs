/// Errors from encoding or decoding values and records.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON (de)serialization failure.
    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary (de)serialization failure.
    #[error("binary codec error: {0}")]
    Binary(#[from] bincode::Error),

    /// A versioned payload carries a version with no registered reader.
    #[error("unknown schema version {version} (current is {current})")]
    UnknownVersion { version: u32, current: u32 },

    /// Bytes are well-formed for the format but not in the expected shape.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Result alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
