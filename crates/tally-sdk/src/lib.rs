//! High-level SDK for the Tally entity data layer.
//!
//! [`DataApi`] is the one handle a game server holds: typed owner and linked
//! fields, links, expiring values, transactions, change events (local or
//! across nodes) and bulk scans, over a pluggable storage backend configured
//! by [`TallyConfig`].

pub mod api;
pub mod bulk;
pub mod config;
pub mod error;

pub use api::{DataApi, DataApiBuilder};
pub use bulk::{LeaderboardEntry, Page};
pub use config::{StorageBackend, StorageConfig, TallyConfig};
pub use error::{SdkError, SdkResult};

// Re-export key types
pub use tally_codec::{Codec, DataFormat};
pub use tally_core::{BucketLayout, DataError, DataResult, Transaction, TxError};
pub use tally_events::{
    LinkChange, MemoryChannel, OwnerChanged, OwnerExpired, PubSub, SharedChanged, SharedExpired,
};
pub use tally_store::{DataStorage, FileStorage, InMemoryStorage};
pub use tally_types::{field, validators, FieldBuilder, LinkType, LinkedField, OwnerField, OwnerId};
