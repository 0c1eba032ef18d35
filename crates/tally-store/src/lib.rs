//! Record storage for Tally.
//!
//! A storage backend is a flat byte store addressed by `(bucket, id)`. Each
//! entity is exactly one record; the data layer above always rewrites the
//! whole record. Backends never interpret record contents.
//!
//! # Backends
//!
//! All backends implement the [`DataStorage`] trait:
//!
//! - [`InMemoryStorage`] -- map-based store for tests and single-process use
//! - [`FileStorage`] -- one file per record under `root/bucket/id.ext`
//!
//! # Design Rules
//!
//! 1. `save` replaces the record atomically from a reader's point of view.
//! 2. A missing record is `Ok(None)`, never an error.
//! 3. All I/O errors are propagated, never retried or swallowed.

pub mod error;
pub mod file;
pub mod memory;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use file::FileStorage;
pub use memory::InMemoryStorage;
pub use traits::DataStorage;
