//! Decoded events, their total order, and stream control items.
//!
//! Every decoded log becomes an [`Event`] carrying its full chain context.
//! Events are delivered to handlers in the order defined by [`OrderKey`]:
//!
//! ```text
//! (block.timestamp, chainId, block.number, transaction.index, log.index)
//! ```
//!
//! The key is total: ties at every level are broken by the next field, so any
//! two distinct events compare unequal and replays produce identical order.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::types::chain::{CachedBlock, CachedLog, CachedTransaction};
use crate::types::primitives::{BlockNumber, ChainId, LogIndex};

// ═══════════════════════════════════════════════════════════════════════════════
// ORDER KEY
// ═══════════════════════════════════════════════════════════════════════════════

/// Total order over events across all chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderKey {
    /// Block timestamp (primary, cross-chain).
    pub timestamp: u64,
    /// Chain id (tiebreak between chains with equal timestamps).
    pub chain_id: ChainId,
    /// Block number within the chain.
    pub block_number: BlockNumber,
    /// Transaction index within the block.
    pub transaction_index: u64,
    /// Log index within the block.
    pub log_index: LogIndex,
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVENT
// ═══════════════════════════════════════════════════════════════════════════════

/// A decoded log event, ready for handler dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Name of the source that produced the event.
    pub source_name: String,
    /// ABI event name.
    pub event_name: String,
    /// Decoded, named arguments.
    ///
    /// Addresses are lowercase hex, integers are decimal strings (arbitrary
    /// precision), byte strings are hex, tuples are objects, arrays are
    /// ordered sequences.
    pub args: serde_json::Value,
    /// The raw log the event was decoded from.
    pub log: CachedLog,
    /// The enclosing block.
    pub block: CachedBlock,
    /// The enclosing transaction.
    pub transaction: CachedTransaction,
    /// Chain the event was emitted on.
    pub chain_id: ChainId,
}

impl Event {
    /// The event's position in the global total order.
    #[must_use]
    pub const fn order_key(&self) -> OrderKey {
        OrderKey {
            timestamp: self.block.timestamp,
            chain_id: self.chain_id,
            block_number: self.log.block_number,
            transaction_index: self.log.transaction_index,
            log_index: self.log.log_index,
        }
    }

    /// The event's per-source checkpoint position.
    #[must_use]
    pub const fn position(&self) -> (BlockNumber, LogIndex) {
        (self.log.block_number, self.log.log_index)
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CHECKPOINT
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable per-source cursor marking the last dispatched event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Chain the source is bound to.
    pub chain_id: ChainId,
    /// Source name.
    pub source_name: String,
    /// Block number of the last completed event.
    pub block_number: BlockNumber,
    /// Log index of the last completed event.
    pub log_index: LogIndex,
}

impl Checkpoint {
    /// True when an event at `position` has already been dispatched.
    #[must_use]
    pub fn covers(&self, position: (BlockNumber, LogIndex)) -> bool {
        position <= (self.block_number, self.log_index)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STREAM ITEMS
// ═══════════════════════════════════════════════════════════════════════════════

/// A chain reorganization notice.
///
/// Not an error: carried in-band on the event stream so the dispatcher can
/// roll back at the correct point in the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReorgNotice {
    /// Chain that reorganized.
    pub chain_id: ChainId,
    /// First block of the diverging segment; all state with
    /// `block_number >= from_block` must be rewound.
    pub from_block: BlockNumber,
}

/// Items carried on the merged event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// A decoded event in total order.
    Event(Box<Event>),
    /// A reorg notice; the dispatcher rolls back before resuming.
    Reorg(ReorgNotice),
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
