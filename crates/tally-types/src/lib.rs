//! Core types for Tally.
//!
//! Fields are declared once at startup and shared everywhere afterwards:
//!
//! - [`OwnerField`] -- an attribute stored on an owner entity (a player)
//! - [`LinkedField`] -- an attribute stored on a shared entity reached
//!   through a [`LinkType`] (an island, a guild)
//!
//! Either may carry a default TTL, which makes it expiring. The capability
//! set of a field is reported by [`FieldKind`].

pub mod field;
pub mod id;
pub mod link;
pub mod validation;

pub use field::{field, FieldBuilder, FieldKind, FieldSpec, FieldValue, LinkedField, OwnerField};
pub use id::OwnerId;
pub use link::{LinkKey, LinkType};
pub use validation::{validators, ValidationError, ValidationResult, Validator};
