//! Validated primitive newtypes used across the engine.
//!
//! These exist for type safety in signatures (a `ChainId` is not a
//! `BlockNumber`) and to centralize the small amount of arithmetic the
//! sync layer does on block numbers.

use std::fmt;

use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════════════
// CHAIN ID
// ═══════════════════════════════════════════════════════════════════════════════

/// EVM chain identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(u64);

impl ChainId {
    /// Create a new chain id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ChainId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<ChainId> for u64 {
    fn from(id: ChainId) -> Self {
        id.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BLOCK NUMBER
// ═══════════════════════════════════════════════════════════════════════════════

/// Block number newtype for clarity in function signatures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockNumber(u64);

impl BlockNumber {
    /// Block zero.
    pub const ZERO: Self = Self(0);

    /// Create a new block number.
    #[must_use]
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// Get the value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// The next block number (saturating at `u64::MAX`).
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// The previous block number (saturating at 0).
    #[must_use]
    pub const fn prev(&self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Saturating subtraction of a depth, for finality boundaries.
    #[must_use]
    pub const fn saturating_sub(&self, depth: u64) -> Self {
        Self(self.0.saturating_sub(depth))
    }
}

impl From<u64> for BlockNumber {
    fn from(n: u64) -> Self {
        Self(n)
    }
}

impl From<BlockNumber> for u64 {
    fn from(b: BlockNumber) -> Self {
        b.0
    }
}

impl From<BlockNumber> for i64 {
    #[allow(clippy::cast_possible_wrap)]
    fn from(b: BlockNumber) -> Self {
        b.0 as Self
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOG INDEX
// ═══════════════════════════════════════════════════════════════════════════════

/// Position of a log within its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogIndex(u64);

impl LogIndex {
    /// Create a new log index.
    #[must_use]
    pub const fn new(i: u64) -> Self {
        Self(i)
    }

    /// Get the value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for LogIndex {
    fn from(i: u64) -> Self {
        Self(i)
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_number_next_prev() {
        let b = BlockNumber::new(100);
        assert_eq!(b.next().value(), 101);
        assert_eq!(b.prev().value(), 99);
        assert_eq!(BlockNumber::ZERO.prev().value(), 0);
    }

    #[test]
    fn block_number_finality_boundary() {
        assert_eq!(BlockNumber::new(100).saturating_sub(12).value(), 88);
        assert_eq!(BlockNumber::new(5).saturating_sub(12).value(), 0);
    }

    #[test]
    fn ordering_is_numeric() {
        assert!(BlockNumber::new(2) < BlockNumber::new(10));
        assert!(LogIndex::new(0) < LogIndex::new(1));
    }
}
