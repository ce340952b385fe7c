//! In-memory chain implementing [`EthApi`] for tests.
//!
//! The mock holds a canonical chain of blocks with attached logs, supports
//! truncate-and-replace reorgs, and can emulate provider range limits on
//! `eth_getLogs`. Request counts are recorded so tests can assert cache reuse.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use alloy::primitives::{Address, B256, Bytes, keccak256};
use alloy::rpc::types::Log;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::rpc::{EthApi, LogFilter};
use crate::types::{BlockNumber, BlockRef};

/// A log attached to a mock block.
#[derive(Debug, Clone)]
pub struct MockLog {
    /// Emitting address.
    pub address: Address,
    /// Topics, topic0 first.
    pub topics: Vec<B256>,
    /// Data region.
    pub data: Bytes,
}

#[derive(Debug, Clone)]
struct MockBlock {
    header: BlockRef,
    logs: Vec<MockLog>,
}

#[derive(Debug, Default)]
struct ChainState {
    /// Canonical chain, ascending by number. May start above zero.
    blocks: Vec<MockBlock>,
    /// Preset `eth_call` responses keyed by `(to, calldata)`.
    calls: HashMap<(Address, Bytes), Bytes>,
}

/// Deterministic block hash for tests: a function of number and a fork tag.
#[must_use]
pub fn block_hash(number: u64, tag: u8) -> B256 {
    let mut preimage = [0u8; 9];
    preimage[..8].copy_from_slice(&number.to_be_bytes());
    preimage[8] = tag;
    keccak256(preimage)
}

/// In-memory mock chain.
#[derive(Debug, Default)]
pub struct MockChain {
    state: Mutex<ChainState>,
    get_logs_calls: AtomicU64,
    /// When set, `eth_getLogs` spans wider than this are rejected with an
    /// application error, the way throttled providers do.
    max_logs_range: Mutex<Option<u64>>,
}

impl MockChain {
    /// Create an empty chain.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append a block with the given fork tag and logs.
    ///
    /// The parent hash links to the current tip (or to `block_hash(n-1, tag)`
    /// when the chain is empty, so chains can start mid-history).
    pub fn push_block(&self, number: u64, timestamp: u64, tag: u8, logs: Vec<MockLog>) {
        let mut state = self.state.lock();
        let parent_hash = state
            .blocks
            .last()
            .map_or_else(|| block_hash(number.saturating_sub(1), tag), |b| b.header.hash);
        state.blocks.push(MockBlock {
            header: BlockRef {
                number: BlockNumber::new(number),
                hash: block_hash(number, tag),
                parent_hash,
                timestamp,
            },
            logs,
        });
    }

    /// Reorg: drop every block with `number >= from`, then append
    /// replacements via [`Self::push_block`].
    pub fn truncate_from(&self, from: u64) {
        let mut state = self.state.lock();
        state.blocks.retain(|b| b.header.number.value() < from);
    }

    /// Reject `eth_getLogs` spans wider than `range` blocks.
    pub fn set_max_logs_range(&self, range: u64) {
        *self.max_logs_range.lock() = Some(range);
    }

    /// Preset an `eth_call` response.
    pub fn set_call_response(&self, to: Address, data: Bytes, response: Bytes) {
        self.state.lock().calls.insert((to, data), response);
    }

    /// Number of `eth_getLogs` requests served so far.
    #[must_use]
    pub fn get_logs_calls(&self) -> u64 {
        self.get_logs_calls.load(Ordering::Relaxed)
    }

    fn to_rpc_log(block: &BlockRef, index: usize, log: &MockLog) -> Log {
        let inner = alloy::primitives::Log::new_unchecked(
            log.address,
            log.topics.clone(),
            log.data.clone(),
        );
        Log {
            inner,
            block_hash: Some(block.hash),
            block_number: Some(block.number.value()),
            block_timestamp: Some(block.timestamp),
            transaction_hash: Some(block_hash(block.number.value(), 0xFE)),
            transaction_index: Some(0),
            log_index: Some(index as u64),
            removed: false,
        }
    }
}

#[async_trait]
impl EthApi for MockChain {
    async fn block_number(&self) -> Result<BlockNumber> {
        let state = self.state.lock();
        state
            .blocks
            .last()
            .map(|b| b.header.number)
            .ok_or_else(|| Error::Decode("mock chain is empty".into()))
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>> {
        self.get_logs_calls.fetch_add(1, Ordering::Relaxed);

        if let Some(limit) = *self.max_logs_range.lock() {
            let span = filter.to_block.value().saturating_sub(filter.from_block.value()) + 1;
            if span > limit {
                return Err(Error::RpcApplication {
                    code: -32005,
                    message: format!("query exceeds max block range {limit}"),
                });
            }
        }

        let state = self.state.lock();
        let mut out = Vec::new();
        for block in &state.blocks {
            for (index, log) in block.logs.iter().enumerate() {
                if filter.matches(log.address, &log.topics, block.header.number) {
                    out.push(Self::to_rpc_log(&block.header, index, log));
                }
            }
        }
        Ok(out)
    }

    async fn block_by_number(&self, number: BlockNumber) -> Result<Option<BlockRef>> {
        let state = self.state.lock();
        Ok(state.blocks.iter().find(|b| b.header.number == number).map(|b| b.header))
    }

    async fn block_by_hash(&self, hash: B256) -> Result<Option<BlockRef>> {
        let state = self.state.lock();
        Ok(state.blocks.iter().find(|b| b.header.hash == hash).map(|b| b.header))
    }

    async fn call(&self, to: Address, data: Bytes, _block: Option<BlockNumber>) -> Result<Bytes> {
        let state = self.state.lock();
        state.calls.get(&(to, data)).cloned().ok_or_else(|| Error::RpcApplication {
            code: -32000,
            message: "execution reverted".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn range_limit_is_enforced() {
        let chain = MockChain::new();
        chain.push_block(0, 1000, 1, vec![]);
        chain.set_max_logs_range(1024);

        let filter = LogFilter {
            from_block: BlockNumber::ZERO,
            to_block: BlockNumber::new(4095),
            ..LogFilter::default()
        };
        let err = chain.get_logs(&filter).await.unwrap_err();
        assert!(err.is_range_limit());
    }

    #[tokio::test]
    async fn reorg_replaces_suffix() {
        let chain = MockChain::new();
        chain.push_block(100, 1000, 1, vec![]);
        chain.push_block(101, 1012, 1, vec![]);
        let old_hash = block_hash(101, 1);
        assert!(chain.block_by_hash(old_hash).await.unwrap().is_some());

        chain.truncate_from(101);
        chain.push_block(101, 1012, 2, vec![]);
        assert!(chain.block_by_hash(old_hash).await.unwrap().is_none());
        assert!(chain.block_by_hash(block_hash(101, 2)).await.unwrap().is_some());
    }
}
