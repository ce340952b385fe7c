//! Cached chain entities: blocks, logs, and transactions.
//!
//! These are the row-shaped records the cache store persists. They carry the
//! minimum header and receipt context handlers need; anything else can be
//! fetched on demand through the gateway.
//!
//! Transactions are hydrated only when a retained log references them, so the
//! cached transaction is built from log context rather than from a full
//! `eth_getTransaction` response.

use alloy::primitives::{Address, B256, Bytes};
use alloy::rpc::types::{Header, Log};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::primitives::{BlockNumber, ChainId, LogIndex};

// ═══════════════════════════════════════════════════════════════════════════════
// BLOCK REF
// ═══════════════════════════════════════════════════════════════════════════════

/// Lightweight block header reference.
///
/// Used by the live follower's confirmed chain suffix and for reorg
/// ancestry walks; cheap to copy and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    /// Block number.
    pub number: BlockNumber,
    /// Block hash.
    pub hash: B256,
    /// Parent block hash.
    pub parent_hash: B256,
    /// Block timestamp (seconds since epoch).
    pub timestamp: u64,
}

impl BlockRef {
    /// Build from an RPC header.
    #[must_use]
    pub fn from_header(header: &Header) -> Self {
        Self {
            number: BlockNumber::new(header.number),
            hash: header.hash,
            parent_hash: header.parent_hash,
            timestamp: header.timestamp,
        }
    }

    /// True when `child` directly extends this block.
    #[must_use]
    pub fn is_parent_of(&self, child: &Self) -> bool {
        child.parent_hash == self.hash && child.number == self.number.next()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CACHED BLOCK
// ═══════════════════════════════════════════════════════════════════════════════

/// A chain block as persisted in the cache, unique per `(chainId, hash)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedBlock {
    /// Chain the block belongs to.
    pub chain_id: ChainId,
    /// Block hash.
    pub hash: B256,
    /// Parent block hash.
    pub parent_hash: B256,
    /// Block number.
    pub number: BlockNumber,
    /// Block timestamp (seconds since epoch).
    pub timestamp: u64,
}

impl CachedBlock {
    /// Build from an RPC header.
    #[must_use]
    pub fn from_header(chain_id: ChainId, header: &Header) -> Self {
        Self {
            chain_id,
            hash: header.hash,
            parent_hash: header.parent_hash,
            number: BlockNumber::new(header.number),
            timestamp: header.timestamp,
        }
    }

    /// The corresponding lightweight reference.
    #[must_use]
    pub const fn as_ref(&self) -> BlockRef {
        BlockRef {
            number: self.number,
            hash: self.hash,
            parent_hash: self.parent_hash,
            timestamp: self.timestamp,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CACHED LOG
// ═══════════════════════════════════════════════════════════════════════════════

/// A log as persisted in the cache, unique per `(chainId, blockHash, logIndex)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedLog {
    /// Chain the log was emitted on.
    pub chain_id: ChainId,
    /// Emitting contract address.
    pub address: Address,
    /// Hash of the enclosing block.
    pub block_hash: B256,
    /// Number of the enclosing block.
    pub block_number: BlockNumber,
    /// Position within the block.
    pub log_index: LogIndex,
    /// Indexed topics (topic0 is the event selector; up to 4 total).
    pub topics: Vec<B256>,
    /// Non-indexed data region.
    pub data: Bytes,
    /// Hash of the enclosing transaction.
    pub transaction_hash: B256,
    /// Index of the enclosing transaction within the block.
    pub transaction_index: u64,
}

impl CachedLog {
    /// Build from an RPC log.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] when the log is pending (missing block or
    /// transaction context). The sync layer only requests mined logs, so a
    /// miss here indicates a misbehaving provider.
    pub fn from_rpc(chain_id: ChainId, log: &Log) -> Result<Self> {
        let block_hash =
            log.block_hash.ok_or_else(|| Error::Decode("log missing block_hash".into()))?;
        let block_number =
            log.block_number.ok_or_else(|| Error::Decode("log missing block_number".into()))?;
        let log_index =
            log.log_index.ok_or_else(|| Error::Decode("log missing log_index".into()))?;
        let transaction_hash = log
            .transaction_hash
            .ok_or_else(|| Error::Decode("log missing transaction_hash".into()))?;
        let transaction_index = log
            .transaction_index
            .ok_or_else(|| Error::Decode("log missing transaction_index".into()))?;

        Ok(Self {
            chain_id,
            address: log.address(),
            block_hash,
            block_number: BlockNumber::new(block_number),
            log_index: LogIndex::new(log_index),
            topics: log.topics().to_vec(),
            data: log.data().data.clone(),
            transaction_hash,
            transaction_index,
        })
    }

    /// The derived transaction record for this log.
    #[must_use]
    pub const fn transaction(&self) -> CachedTransaction {
        CachedTransaction {
            chain_id: self.chain_id,
            hash: self.transaction_hash,
            block_hash: self.block_hash,
            block_number: self.block_number,
            index: self.transaction_index,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CACHED TRANSACTION
// ═══════════════════════════════════════════════════════════════════════════════

/// A transaction as persisted in the cache, unique per `(chainId, hash)`.
///
/// Hydrated from log context: only transactions referenced by at least one
/// retained log are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedTransaction {
    /// Chain the transaction was included on.
    pub chain_id: ChainId,
    /// Transaction hash.
    pub hash: B256,
    /// Hash of the enclosing block.
    pub block_hash: B256,
    /// Number of the enclosing block.
    pub block_number: BlockNumber,
    /// Index within the block.
    pub index: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn block_ref(number: u64, hash: u8, parent: u8) -> BlockRef {
        BlockRef {
            number: BlockNumber::new(number),
            hash: B256::from([hash; 32]),
            parent_hash: B256::from([parent; 32]),
            timestamp: number * 12,
        }
    }

    #[test]
    fn parent_link_requires_hash_and_number() {
        let parent = block_ref(100, 0xAA, 0x99);
        let child = block_ref(101, 0xBB, 0xAA);
        assert!(parent.is_parent_of(&child));

        // Right hash, wrong number
        let skipped = block_ref(102, 0xBB, 0xAA);
        assert!(!parent.is_parent_of(&skipped));

        // Right number, wrong hash
        let forked = block_ref(101, 0xBB, 0xCC);
        assert!(!parent.is_parent_of(&forked));
    }

    #[test]
    fn pending_log_is_rejected() {
        let log = Log::default();
        let err = CachedLog::from_rpc(ChainId::new(1), &log);
        assert!(err.is_err());
    }
}
