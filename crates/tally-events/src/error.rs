use tally_codec::CodecError;

/// Errors from event encoding and pub/sub transport.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// A value or key could not be encoded or decoded.
    #[error("event codec error: {0}")]
    Codec(#[from] CodecError),

    /// Envelope JSON failure.
    #[error("envelope json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The envelope parsed but does not fit the registered handler.
    #[error("malformed envelope: {0}")]
    Envelope(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

/// Result alias for event operations.
pub type EventResult<T> = Result<T, EventError>;
