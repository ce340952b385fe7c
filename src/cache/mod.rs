//! Persistent cache of blocks, logs, transactions, and synced intervals.
//!
//! The cache is the engine's source of truth for "what has already been
//! fetched". A committed interval for a source fingerprint is a promise:
//! every matching log in that block range, plus its block and transaction
//! context, is present. The historical fetcher therefore commits a slice's
//! logs, blocks, and interval in one transaction; the cache never claims
//! coverage it does not have.
//!
//! One relational backend serves both development (embedded SQLite) and
//! production (PostgreSQL); see [`SqlCacheStore`].

use async_trait::async_trait;

use crate::error::Result;
use crate::rpc::LogFilter;
use crate::sources::SourceFingerprint;
use crate::types::{
    BlockNumber, CachedBlock, CachedLog, CachedTransaction, ChainId, Checkpoint, LogIndex,
};

pub mod intervals;
mod sql;

pub use intervals::{BlockRange, IntervalSet};
pub use sql::SqlCacheStore;

// ═══════════════════════════════════════════════════════════════════════════════
// CACHE STORE PORT
// ═══════════════════════════════════════════════════════════════════════════════

/// Port for the persistent chain-data cache.
///
/// All write operations are transactional and idempotent on primary key, so
/// concurrent inserts of the same block or log are harmless. Interval merges
/// for one `(chain, fingerprint)` are serialized by the implementation.
#[async_trait]
pub trait CacheStore: std::fmt::Debug + Send + Sync {
    /// Create the schema if it does not exist.
    async fn migrate(&self) -> Result<()>;

    /// Insert a block; a duplicate `(chainId, hash)` is a no-op.
    async fn insert_block(&self, block: &CachedBlock) -> Result<()>;

    /// Insert logs; duplicates on `(chainId, blockHash, logIndex)` are no-ops.
    async fn insert_logs(&self, logs: &[CachedLog]) -> Result<()>;

    /// Insert transactions; duplicates on `(chainId, hash)` are no-ops.
    async fn insert_transactions(&self, transactions: &[CachedTransaction]) -> Result<()>;

    /// Atomically persist a fully fetched slice: its logs, hydrated blocks
    /// and transactions, and the covering interval.
    ///
    /// This is the only way an interval enters the store from the sync
    /// layer, which guarantees coverage soundness.
    async fn commit_slice(
        &self,
        chain_id: ChainId,
        fingerprint: &SourceFingerprint,
        range: BlockRange,
        logs: &[CachedLog],
        blocks: &[CachedBlock],
        transactions: &[CachedTransaction],
    ) -> Result<()>;

    /// Merge an interval into the stored set for `(chain, fingerprint)`.
    async fn record_interval(
        &self,
        chain_id: ChainId,
        fingerprint: &SourceFingerprint,
        range: BlockRange,
    ) -> Result<()>;

    /// The stored disjoint interval set for `(chain, fingerprint)`.
    async fn cached_intervals(
        &self,
        chain_id: ChainId,
        fingerprint: &SourceFingerprint,
    ) -> Result<IntervalSet>;

    /// Cached logs matching `filter`, ordered by `(blockNumber, logIndex)`.
    async fn get_logs(&self, chain_id: ChainId, filter: &LogFilter) -> Result<Vec<CachedLog>>;

    /// A cached block by hash.
    async fn get_block(&self, chain_id: ChainId, hash: alloy::primitives::B256)
    -> Result<Option<CachedBlock>>;

    /// True when the block is already cached.
    async fn has_block(&self, chain_id: ChainId, hash: alloy::primitives::B256) -> Result<bool> {
        Ok(self.get_block(chain_id, hash).await?.is_some())
    }

    /// Purge logs, blocks, and transactions with `blockNumber >= block`, and
    /// truncate every interval claiming coverage at or above it.
    ///
    /// Used on reorg rollback; afterwards the cache describes exactly the
    /// chain up to `block - 1`.
    async fn delete_from_block(&self, chain_id: ChainId, block: BlockNumber) -> Result<()>;

    /// Upsert a per-source checkpoint.
    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Load a per-source checkpoint.
    async fn get_checkpoint(
        &self,
        chain_id: ChainId,
        source_name: &str,
    ) -> Result<Option<Checkpoint>>;

    /// Remove a per-source checkpoint (reorg rewound past every event).
    async fn delete_checkpoint(&self, chain_id: ChainId, source_name: &str) -> Result<()>;

    /// The greatest `(blockNumber, logIndex)` of a cached log matching
    /// `filter` with `blockNumber < before`, if any.
    ///
    /// Used to reset checkpoints after a rollback.
    async fn latest_log_before(
        &self,
        chain_id: ChainId,
        filter: &LogFilter,
        before: BlockNumber,
    ) -> Result<Option<(BlockNumber, LogIndex)>>;
}
