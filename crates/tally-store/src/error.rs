/// Errors from storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A bucket or id that cannot be mapped onto the backend safely.
    #[error("invalid record address {bucket}/{id}: {reason}")]
    InvalidId {
        bucket: String,
        id: String,
        reason: &'static str,
    },
}

/// Result alias for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;
