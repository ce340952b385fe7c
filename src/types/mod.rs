//! Domain types: primitives, cached chain entities, and events.

pub mod chain;
pub mod events;
pub mod primitives;

pub use chain::{BlockRef, CachedBlock, CachedLog, CachedTransaction};
pub use events::{Checkpoint, Event, OrderKey, ReorgNotice, StreamItem};
pub use primitives::{BlockNumber, ChainId, LogIndex};
