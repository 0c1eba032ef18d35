//! The Tally data layer core.
//!
//! Owner entities (players) and shared entities (islands, guilds) are both
//! held by an [`EntityStore`]: one re-entrant lock and one lazily loaded
//! [`EntityContainer`] per entity, written through to storage as a whole
//! record on every change. On top of the stores sit the [`LinkRegistry`],
//! the [`ExpirationTracker`] and single-entity [`Transaction`]s, all wired
//! together by the [`Engine`].
//!
//! # Locking
//!
//! 1. Every operation on an entity runs under that entity's lock for its
//!    whole duration, including storage I/O and listener delivery.
//! 2. No code path holds two entity locks. An owner transaction that touches
//!    linked fields reaches the shared container through its own short-lived
//!    mutex, never through the shared entity's lock.
//! 3. The link registry and expiration tracker have their own internal
//!    synchronization and may be read without any entity lock.

pub mod container;
pub mod engine;
pub mod error;
pub mod expiry;
pub mod key;
pub mod links;
pub mod store;
pub mod transaction;

pub use container::EntityContainer;
pub use engine::{Engine, EngineOptions};
pub use error::{DataError, DataResult, TxError};
pub use expiry::{ExpirationTracker, Sweeper, DEFAULT_SWEEP_INTERVAL};
pub use key::{BucketLayout, EntityKey, ExpiryScope, SharedKey};
pub use links::LinkRegistry;
pub use store::{EntityStore, Held, Pinned};
pub use transaction::Transaction;
