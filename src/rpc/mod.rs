//! Per-network RPC channel: the chain client port and its gateway
//! implementation.
//!
//! Everything the engine asks of a chain goes through the [`EthApi`] port, so
//! the sync layer can be tested against an in-memory chain. The production
//! implementation is [`RpcGateway`]: bounded concurrency, retries with
//! backoff and jitter, and prioritized transport fallback.

use alloy::primitives::{Address, B256, Bytes};
use alloy::rpc::types::Log;
use async_trait::async_trait;

use crate::error::Result;
use crate::types::{BlockNumber, BlockRef};

mod gateway;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use gateway::{RetryPolicy, RpcGateway};

// ═══════════════════════════════════════════════════════════════════════════════
// LOG FILTER
// ═══════════════════════════════════════════════════════════════════════════════

/// A log query: block range, address set, and topic constraints.
///
/// Empty address or topic0 sets match anything, mirroring `eth_getLogs`
/// semantics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    /// First block, inclusive.
    pub from_block: BlockNumber,
    /// Last block, inclusive.
    pub to_block: BlockNumber,
    /// Contract addresses to match; empty matches all.
    pub addresses: Vec<Address>,
    /// Event selectors (topic0) to match; empty matches all.
    pub topic0: Vec<B256>,
    /// Positional constraints on topics 1-3.
    pub topics: [Option<B256>; 3],
}

impl LogFilter {
    /// Restrict this filter to a single block.
    #[must_use]
    pub fn at_block(mut self, block: BlockNumber) -> Self {
        self.from_block = block;
        self.to_block = block;
        self
    }

    /// True when the given log fields satisfy the filter.
    #[must_use]
    pub fn matches(&self, address: Address, topics: &[B256], block_number: BlockNumber) -> bool {
        if block_number < self.from_block || block_number > self.to_block {
            return false;
        }
        if !self.addresses.is_empty() && !self.addresses.contains(&address) {
            return false;
        }
        if !self.topic0.is_empty() {
            match topics.first() {
                Some(t0) if self.topic0.contains(t0) => {}
                _ => return false,
            }
        }
        for (i, wanted) in self.topics.iter().enumerate() {
            if let Some(wanted) = wanted {
                if topics.get(i + 1) != Some(wanted) {
                    return false;
                }
            }
        }
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ETH API PORT
// ═══════════════════════════════════════════════════════════════════════════════

/// Chain client port.
///
/// One instance per network. Implementations are responsible for their own
/// retry and concurrency policy; callers treat every method as a single
/// logical request.
#[async_trait]
pub trait EthApi: std::fmt::Debug + Send + Sync {
    /// Current tip block number.
    async fn block_number(&self) -> Result<BlockNumber>;

    /// Logs matching the filter, as returned by `eth_getLogs`.
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>>;

    /// Header of the block at `number` on the current canonical chain.
    async fn block_by_number(&self, number: BlockNumber) -> Result<Option<BlockRef>>;

    /// Header of the block with the given hash.
    async fn block_by_hash(&self, hash: B256) -> Result<Option<BlockRef>>;

    /// Read-only contract call (`eth_call`), optionally pinned to a block.
    async fn call(&self, to: Address, data: Bytes, block: Option<BlockNumber>) -> Result<Bytes>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
