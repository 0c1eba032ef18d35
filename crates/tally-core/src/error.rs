use tally_codec::CodecError;
use tally_events::EventError;
use tally_store::StoreError;
use tally_types::{OwnerId, ValidationError};

/// Errors surfaced by data layer operations.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    /// The field's validator rejected the value. Nothing was written.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A linked write was attempted for an owner with no link of that type.
    #[error("owner {owner} is not linked to {link_type}")]
    NotLinked { owner: OwnerId, link_type: String },

    #[error("no active expiration for {field}")]
    NoActiveExpiration { field: String },

    #[error("{field} is not an expiring field")]
    NotExpiring { field: String },

    #[error("listeners are not supported by the {backend} storage backend")]
    ListenersUnsupported { backend: &'static str },

    /// Two field declarations share a full key but not a value type.
    #[error("field {field} holds a value of a different type")]
    TypeMismatch { field: String },

    #[error("transaction is closed")]
    TransactionClosed,

    #[error("link type {actual} is outside the transaction scope {expected}")]
    LinkTypeMismatch { expected: String, actual: String },

    #[error("owner field {field} is not available in a direct transaction")]
    NoOwnerScope { field: String },

    /// Raised by caller code, typically a transaction body.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("event error: {0}")]
    Event(#[from] EventError),
}

/// Result alias for data layer operations.
pub type DataResult<T> = Result<T, DataError>;

/// Outcome of a transaction body that did not complete normally.
#[derive(Debug, thiserror::Error)]
pub enum TxError {
    /// The body asked for a rollback. The transaction yields no result.
    #[error("transaction aborted")]
    Aborted,

    /// The body failed. The transaction is rolled back and this propagates.
    #[error(transparent)]
    Failed(#[from] DataError),
}

impl TxError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Failed(DataError::Rejected(reason.into()))
    }
}

impl From<ValidationError> for TxError {
    fn from(err: ValidationError) -> Self {
        Self::Failed(err.into())
    }
}
