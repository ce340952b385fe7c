//! Live tail follower: extend the confirmed chain, detect reorgs, rewind.
//!
//! One follower per network. It polls the tip at the configured interval and
//! maintains a **confirmed chain suffix**: the most recent
//! `finality + RETAINED_MARGIN` headers, each with hash and parent hash.
//!
//! On a new head:
//!
//! 1. Parent hash matches the suffix tip: extend, fetch that block's logs for
//!    the union of active source filters, cache them, and hand the block to
//!    the event stream.
//! 2. Parent hash mismatch: walk backward through `eth_getBlockByHash` until
//!    a suffix entry matches (the common ancestor). Everything above it is
//!    invalidated: the cache is purged with `delete_from_block`, a reorg
//!    notice is sent downstream in-band, and the new segment is re-fetched.
//! 3. Blocks that sink below `tip - finality` transition to final and their
//!    range is committed to the cache as covered intervals per source.
//!
//! A walk that cannot find an ancestor at or above the finality boundary is a
//! deep reorg and fatal.

use std::collections::VecDeque;
use std::sync::Arc;

use alloy::primitives::Address;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::{BlockRange, CacheStore};
use crate::error::{Error, Result};
use crate::health::HealthState;
use crate::rpc::{EthApi, LogFilter};
use crate::sources::{Source, SourceResolver};
use crate::stats::EngineStats;
use crate::types::{
    BlockNumber, BlockRef, CachedBlock, CachedLog, CachedTransaction, ChainId, ReorgNotice,
};

/// Extra headers retained beyond the finality depth, so ancestor walks have
/// slack around the boundary.
const RETAINED_MARGIN: u64 = 16;

// ═══════════════════════════════════════════════════════════════════════════════
// LIVE UPDATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Items the follower hands to the event stream, in chain order.
#[derive(Debug, Clone)]
pub enum LiveUpdate {
    /// A new confirmed block with the logs matching any active source.
    Block {
        /// The block itself.
        block: CachedBlock,
        /// Matching logs, ordered by log index.
        logs: Vec<CachedLog>,
    },
    /// The chain diverged; state from `from_block` on is invalid.
    Reorg(ReorgNotice),
}

// ═══════════════════════════════════════════════════════════════════════════════
// LIVE FOLLOWER
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-network live follower.
#[derive(Debug)]
pub struct LiveFollower {
    chain_id: ChainId,
    network: String,
    client: Arc<dyn EthApi>,
    cache: Arc<dyn CacheStore>,
    resolver: Arc<SourceResolver>,
    stats: Arc<EngineStats>,
    sources: Vec<Arc<Source>>,
    finality: u64,
    poll_interval: std::time::Duration,
    out: mpsc::Sender<LiveUpdate>,
    health: Arc<HealthState>,

    /// Confirmed chain suffix, ascending by number.
    suffix: VecDeque<BlockRef>,
    /// Highest block already committed to the cache as finalized coverage.
    finalized_committed: BlockNumber,
}

impl LiveFollower {
    /// Create a follower that begins tailing at `from_block`.
    ///
    /// `finalized_committed` is the historical sync boundary: interval
    /// commits for finalized live blocks start right above it.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        chain_id: ChainId,
        network: impl Into<String>,
        client: Arc<dyn EthApi>,
        cache: Arc<dyn CacheStore>,
        resolver: Arc<SourceResolver>,
        stats: Arc<EngineStats>,
        sources: Vec<Arc<Source>>,
        finality: u64,
        poll_interval: std::time::Duration,
        out: mpsc::Sender<LiveUpdate>,
        health: Arc<HealthState>,
        finalized_committed: BlockNumber,
    ) -> Self {
        Self {
            chain_id,
            network: network.into(),
            client,
            cache,
            resolver,
            stats,
            sources,
            finality,
            poll_interval,
            out,
            health,
            suffix: VecDeque::new(),
            finalized_committed,
        }
    }

    /// Run the follower until cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeepReorg`] when the chain diverges past the finality
    /// boundary, or the underlying RPC/cache error when one becomes fatal.
    #[instrument(skip_all, fields(net = %self.network))]
    pub async fn run(mut self, from_block: BlockNumber, shutdown: CancellationToken) -> Result<()> {
        info!(from = %from_block, finality = self.finality, "live follower started");

        // Seed the suffix with the block below the start so the first head
        // has a parent to link against.
        if from_block > BlockNumber::ZERO {
            if let Some(parent) = self.client.block_by_number(from_block.prev()).await? {
                self.suffix.push_back(parent);
            }
        }

        let mut next = from_block;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("live follower stopping");
                    return Ok(());
                }
                () = tokio::time::sleep(self.poll_interval) => {}
            }

            let tip = self.client.block_number().await?;
            self.health.set_tip(&self.network, tip);
            while next <= tip {
                if shutdown.is_cancelled() {
                    return Ok(());
                }
                let Some(header) = self.client.block_by_number(next).await? else {
                    // Provider lag; retry on the next poll.
                    break;
                };
                next = self.process_head(header, tip).await?;
            }
        }
    }

    /// Handle one new head; returns the next block number to process.
    async fn process_head(&mut self, header: BlockRef, tip: BlockNumber) -> Result<BlockNumber> {
        let links = match self.suffix.back() {
            None => true,
            Some(tip_ref) => tip_ref.is_parent_of(&header),
        };

        if links {
            self.extend(header, tip).await?;
            return Ok(header.number.next());
        }

        // Fork: find the common ancestor and rewind.
        let ancestor = self.find_ancestor(&header, tip).await?;
        let fork_block = ancestor.next();
        warn!(
            ancestor = %ancestor,
            detected_at = %header.number,
            depth = header.number.value().saturating_sub(ancestor.value()),
            "reorg detected, rewinding"
        );
        EngineStats::add(&self.stats.reorgs_handled, 1);

        self.suffix.retain(|b| b.number <= ancestor);
        self.cache.delete_from_block(self.chain_id, fork_block).await?;
        self.out
            .send(LiveUpdate::Reorg(ReorgNotice { chain_id: self.chain_id, from_block: fork_block }))
            .await
            .map_err(|_| Error::ChannelClosed("live updates"))?;

        // Re-fetch the replaced segment from the fork point.
        Ok(fork_block)
    }

    /// Walk backward from `header` until a suffix entry matches.
    async fn find_ancestor(&self, header: &BlockRef, tip: BlockNumber) -> Result<BlockNumber> {
        let finalized = tip.saturating_sub(self.finality);
        let mut cursor = *header;

        loop {
            let parent_number = cursor.number.prev();
            if self.suffix.iter().any(|b| b.number == parent_number && b.hash == cursor.parent_hash)
            {
                return Ok(parent_number);
            }
            if parent_number < finalized || cursor.number == BlockNumber::ZERO {
                return Err(Error::DeepReorg {
                    chain_id: self.chain_id.value(),
                    fork_block: cursor.number.value(),
                    finalized: finalized.value(),
                });
            }
            cursor = self.client.block_by_hash(cursor.parent_hash).await?.ok_or_else(|| {
                Error::Decode(format!(
                    "parent {:x} of reorged block {} not found",
                    cursor.parent_hash, cursor.number
                ))
            })?;
        }
    }

    /// Extend the suffix with a linking head and deliver its events.
    async fn extend(&mut self, header: BlockRef, tip: BlockNumber) -> Result<()> {
        let block = CachedBlock {
            chain_id: self.chain_id,
            hash: header.hash,
            parent_hash: header.parent_hash,
            number: header.number,
            timestamp: header.timestamp,
        };

        let mut logs = self.fetch_block_logs(header).await?;
        // Creation events in this block may add children that also emitted
        // here; one refetch with the grown set captures them.
        if self.discover_children(&logs) {
            logs = self.fetch_block_logs(header).await?;
            self.discover_children(&logs);
        }

        let transactions: Vec<CachedTransaction> = {
            let mut txs: Vec<CachedTransaction> = logs.iter().map(CachedLog::transaction).collect();
            txs.sort_by_key(|t| t.hash);
            txs.dedup_by_key(|t| t.hash);
            txs
        };
        self.cache.insert_block(&block).await?;
        self.cache.insert_logs(&logs).await?;
        self.cache.insert_transactions(&transactions).await?;
        EngineStats::add(&self.stats.logs_fetched, logs.len() as u64);
        EngineStats::add(&self.stats.blocks_hydrated, 1);

        self.suffix.push_back(header);
        let retain = self.finality + RETAINED_MARGIN;
        while self.suffix.len() as u64 > retain.max(1) {
            self.suffix.pop_front();
        }

        self.out
            .send(LiveUpdate::Block { block, logs })
            .await
            .map_err(|_| Error::ChannelClosed("live updates"))?;

        self.commit_finalized(tip).await
    }

    /// Fetch this block's logs for the union of active source filters.
    async fn fetch_block_logs(&self, header: BlockRef) -> Result<Vec<CachedLog>> {
        let Some(filter) = self.union_filter(header.number) else {
            return Ok(Vec::new());
        };
        let raw = self.client.get_logs(&filter).await?;
        let mut logs = Vec::with_capacity(raw.len());
        for log in &raw {
            let log = CachedLog::from_rpc(self.chain_id, log)?;
            // The union filter over-matches; keep a log only if some source
            // (or factory parent criteria) actually wants it.
            if self.attributable(&log) {
                logs.push(log);
            }
        }
        logs.sort_by_key(|log| log.log_index);
        Ok(logs)
    }

    /// One filter covering every active source on this network at `block`.
    fn union_filter(&self, block: BlockNumber) -> Option<LogFilter> {
        let mut addresses: Vec<Address> = Vec::new();
        let mut topic0 = Vec::new();
        let mut any = false;

        for source in &self.sources {
            if source.start_block > block
                || source.end_block.is_some_and(|end| end < block)
            {
                continue;
            }
            any = true;
            let filter = source.log_filter(block, block, &self.resolver.children(&source.name));
            addresses.extend(filter.addresses);
            topic0.extend(filter.topic0);
            if let Some(parent) = source.parent_filter(block, block) {
                addresses.extend(parent.addresses);
                topic0.extend(parent.topic0);
            }
        }
        if !any {
            return None;
        }
        addresses.sort_unstable();
        addresses.dedup();
        topic0.sort_unstable();
        topic0.dedup();

        Some(LogFilter { from_block: block, to_block: block, addresses, topic0, topics: [None; 3] })
    }

    /// True when some source's own filter (or parent criteria) matches.
    fn attributable(&self, log: &CachedLog) -> bool {
        self.sources.iter().any(|source| {
            let own = source.log_filter(
                log.block_number,
                log.block_number,
                &self.resolver.children(&source.name),
            );
            own.matches(log.address, &log.topics, log.block_number)
                || source
                    .parent_filter(log.block_number, log.block_number)
                    .is_some_and(|parent| parent.matches(log.address, &log.topics, log.block_number))
        })
    }

    /// Extract factory children from creation events; true when any was new.
    fn discover_children(&self, logs: &[CachedLog]) -> bool {
        let mut grew = false;
        for source in &self.sources {
            let Some(criteria) = source.factory() else { continue };
            for log in logs {
                if log.address == criteria.address
                    && log.topics.first() == Some(&criteria.event.selector())
                {
                    if let Some(child) = criteria.child_location.extract(&log.topics, &log.data) {
                        if self.resolver.add_child(&source.name, child) {
                            info!(source = %source.name, child = %child, "live factory child");
                            grew = true;
                        }
                    }
                }
            }
        }
        grew
    }

    /// Commit coverage intervals for blocks that have become final.
    ///
    /// Only ranges at or below `tip - finality` at commit time are recorded,
    /// so the cache never claims still-reorganizable coverage.
    async fn commit_finalized(&mut self, tip: BlockNumber) -> Result<()> {
        let finalized = tip.saturating_sub(self.finality);
        // Clamp to what the suffix has actually delivered downstream.
        let delivered = self.suffix.back().map_or(BlockNumber::ZERO, |b| b.number);
        let up_to = finalized.min(delivered);
        if up_to <= self.finalized_committed {
            return Ok(());
        }
        let from = self.finalized_committed.next();

        for source in &self.sources {
            let start = source.start_block.max(from);
            let end = source.end_block.map_or(up_to, |e| e.min(up_to));
            if start > end {
                continue;
            }
            let range = BlockRange::new(start.value(), end.value());
            self.cache.record_interval(self.chain_id, &source.fingerprint(), range).await?;
            if let Some(parent_fp) = source.parent_fingerprint() {
                self.cache.record_interval(self.chain_id, &parent_fp, range).await?;
            }
        }

        debug!(from = %from, to = %up_to, "committed finalized live coverage");
        self.finalized_committed = up_to;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
