use thiserror::Error;

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("cannot render configuration: {0}")]
    ConfigRender(#[from] toml::ser::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] tally_store::StoreError),

    #[error("event error: {0}")]
    Event(#[from] tally_events::EventError),

    #[error(transparent)]
    Data(#[from] tally_core::DataError),
}

pub type SdkResult<T> = Result<T, SdkError>;
