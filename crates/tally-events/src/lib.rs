//! Change notification for Tally.
//!
//! The [`EventBus`] delivers typed events synchronously, on the thread that
//! made the change, while that thread still holds the entity's lock. The
//! [`DistributedEventBus`] decorates a local bus: every fired event is also
//! published as an [`Envelope`] on a shared [`PubSub`] channel, and events
//! received from other nodes are re-fired on the local bus only.
//!
//! Core code fires through a [`Notifier`], which is one or the other.

pub mod bus;
pub mod distributed;
pub mod envelope;
pub mod error;
pub mod event;
pub mod notifier;
pub mod pubsub;

pub use bus::EventBus;
pub use distributed::DistributedEventBus;
pub use envelope::{Envelope, EnvelopeBody};
pub use error::{EventError, EventResult};
pub use event::{LinkChange, OwnerChanged, OwnerExpired, SharedChanged, SharedExpired, Topic};
pub use notifier::Notifier;
pub use pubsub::{MemoryChannel, MemoryPubSub, MessageHandler, PubSub};
