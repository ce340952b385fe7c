//! Historical backfill: range-partitioned log fetch with block hydration.
//!
//! The fetcher drives each source's pre-tip sync:
//!
//! 1. Resolve the source's effective filter (factory parents first).
//! 2. Subtract cached coverage from the requested range.
//! 3. Split the missing ranges into slices of at most `max_block_range`
//!    blocks and feed them to a bounded worker pool as tagged tasks.
//!
//! ```text
//!  required ranges ──▶ [LogsSlice]──eth_getLogs──▶ logs
//!                          │   │                     │
//!            range too big │   └──▶ [BlockByHash]──eth_getBlockByHash──▶ blocks
//!            (halve, requeue)                  │
//!                                              ▼ last block of slice
//!                                    commit_slice(logs+blocks+interval)
//! ```
//!
//! A slice's interval is committed atomically with its logs and hydrated
//! blocks, and only after every block task for the slice has finished. An
//! aborted run therefore leaves the cache consistent: at worst it re-fetches
//! a slice, never trusts one it did not finish.
//!
//! Workers are a select loop over one task channel; log and block tasks share
//! the per-network concurrency budget enforced by the RPC gateway.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use alloy::primitives::B256;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument};

use crate::cache::{BlockRange, CacheStore};
use crate::error::{Error, Result};
use crate::rpc::EthApi;
use crate::sources::{Source, SourceFingerprint, SourceResolver};
use crate::stats::EngineStats;
use crate::types::{BlockNumber, CachedBlock, CachedLog, CachedTransaction, ChainId};

// ═══════════════════════════════════════════════════════════════════════════════
// TASKS
// ═══════════════════════════════════════════════════════════════════════════════

/// One log slice to fetch.
#[derive(Debug, Clone)]
struct SliceJob {
    source: Arc<Source>,
    fingerprint: SourceFingerprint,
    range: BlockRange,
    /// True when scanning the factory parent's creation events.
    parent_scan: bool,
}

/// Accumulated state of a slice awaiting block hydration.
#[derive(Debug)]
struct SliceState {
    job: SliceJob,
    logs: Vec<CachedLog>,
    transactions: Vec<CachedTransaction>,
    blocks: Mutex<Vec<CachedBlock>>,
    remaining: AtomicUsize,
}

/// Tagged task variants consumed by the worker select loop.
#[derive(Debug)]
enum FetchTask {
    LogsSlice(SliceJob),
    BlockByHash { hash: B256, state: Arc<SliceState> },
    Shutdown,
}

/// Shared queue bookkeeping for one backfill run.
#[derive(Debug)]
struct RunState {
    queue: mpsc::UnboundedSender<FetchTask>,
    pending: AtomicUsize,
    drained: Notify,
    failure: Mutex<Option<Error>>,
}

impl RunState {
    fn enqueue(&self, task: FetchTask) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        // Receiver outlives the run; a send failure means we are shutting down.
        if self.queue.send(task).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn task_done(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    fn fail(&self, error: Error) {
        let mut slot = self.failure.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        self.drained.notify_waiters();
    }

    fn failed(&self) -> bool {
        self.failure.lock().is_some()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HISTORICAL FETCHER
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-network historical fetcher.
#[derive(Debug)]
pub struct HistoricalFetcher {
    chain_id: ChainId,
    network: String,
    client: Arc<dyn EthApi>,
    cache: Arc<dyn CacheStore>,
    resolver: Arc<SourceResolver>,
    stats: Arc<EngineStats>,
    workers: usize,
}

impl HistoricalFetcher {
    /// Create a fetcher for one network.
    #[must_use]
    pub fn new(
        chain_id: ChainId,
        network: impl Into<String>,
        client: Arc<dyn EthApi>,
        cache: Arc<dyn CacheStore>,
        resolver: Arc<SourceResolver>,
        stats: Arc<EngineStats>,
        workers: usize,
    ) -> Self {
        Self {
            chain_id,
            network: network.into(),
            client,
            cache,
            resolver,
            stats,
            workers: workers.max(1),
        }
    }

    /// Backfill every source on this network up to `finalized_tip`.
    ///
    /// Factory parents are synced before their children so the child address
    /// set is materialized when child slices run.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error of any slice; partially fetched slices
    /// leave no interval behind.
    #[instrument(skip_all, fields(net = %self.network, finalized = %finalized_tip))]
    pub async fn backfill_all(
        self: &Arc<Self>,
        sources: &[Arc<Source>],
        finalized_tip: BlockNumber,
    ) -> Result<()> {
        for source in sources {
            self.backfill_source(source, finalized_tip).await?;
        }
        Ok(())
    }

    /// Backfill a single source up to `finalized_tip`.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error of any slice.
    #[instrument(skip_all, fields(net = %self.network, source = %source.name))]
    pub async fn backfill_source(
        self: &Arc<Self>,
        source: &Arc<Source>,
        finalized_tip: BlockNumber,
    ) -> Result<()> {
        let sync_end = source.end_block.map_or(finalized_tip, |end| end.min(finalized_tip));
        if source.start_block > sync_end {
            debug!(start = %source.start_block, end = %sync_end, "nothing to backfill");
            return Ok(());
        }
        let requested = BlockRange::new(source.start_block.value(), sync_end.value());

        // Factory sources: sync the parent's creation events first, then
        // materialize the child set the child slices will filter on.
        if source.is_factory() {
            let parent_fp = source
                .parent_fingerprint()
                .ok_or_else(|| Error::Config(format!("{}: factory without criteria", source.name)))?;
            self.run_ranges(source, &parent_fp, requested, true).await?;
            let children =
                self.resolver.refresh_children(source, self.cache.as_ref(), sync_end).await?;
            info!(source = %source.name, children = children.len(), "materialized factory children");
        }

        self.run_ranges(source, &source.fingerprint(), requested, false).await
    }

    /// Fetch the uncached portion of `requested` for one fingerprint.
    async fn run_ranges(
        self: &Arc<Self>,
        source: &Arc<Source>,
        fingerprint: &SourceFingerprint,
        requested: BlockRange,
        parent_scan: bool,
    ) -> Result<()> {
        let cached = self.cache.cached_intervals(self.chain_id, fingerprint).await?;
        let required = cached.subtract_from(requested);
        if required.is_empty() {
            debug!(range = %requested, "range fully cached");
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let run = Arc::new(RunState {
            queue: tx,
            pending: AtomicUsize::new(0),
            drained: Notify::new(),
            failure: Mutex::new(None),
        });

        let mut slices = 0usize;
        for range in required {
            for slice in range.chunks(source.max_block_range) {
                run.enqueue(FetchTask::LogsSlice(SliceJob {
                    source: Arc::clone(source),
                    fingerprint: fingerprint.clone(),
                    range: slice,
                    parent_scan,
                }));
                slices += 1;
            }
        }
        info!(range = %requested, slices, parent_scan, "backfill started");

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = JoinSet::new();
        for _ in 0..self.workers {
            let fetcher = Arc::clone(self);
            let run = Arc::clone(&run);
            let rx = Arc::clone(&rx);
            workers.spawn(async move { fetcher.worker_loop(&run, &rx).await });
        }

        // Drain: wait until every enqueued task (including requeues) settled
        // or a task recorded a fatal error. The waiter registers before
        // checking so a completion between check and await cannot be lost.
        loop {
            let notified = run.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if run.failed() || run.pending.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
        for _ in 0..self.workers {
            let _ = run.queue.send(FetchTask::Shutdown);
        }
        while workers.join_next().await.is_some() {}

        match run.failure.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Select loop: pull tagged tasks until shutdown.
    async fn worker_loop(
        &self,
        run: &Arc<RunState>,
        rx: &Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<FetchTask>>>,
    ) {
        loop {
            let task = {
                let mut guard = rx.lock().await;
                guard.recv().await
            };
            match task {
                Some(FetchTask::Shutdown) | None => break,
                Some(FetchTask::LogsSlice(job)) => {
                    if !run.failed() {
                        if let Err(error) = self.process_slice(run, job).await {
                            run.fail(error);
                        }
                    }
                    run.task_done();
                }
                Some(FetchTask::BlockByHash { hash, state }) => {
                    if !run.failed() {
                        if let Err(error) = self.process_block(hash, &state).await {
                            run.fail(error);
                        }
                    }
                    run.task_done();
                }
            }
        }
    }

    /// Fetch one log slice; on success hydrate blocks and commit.
    async fn process_slice(&self, run: &Arc<RunState>, job: SliceJob) -> Result<()> {
        let filter = if job.parent_scan {
            job.source.parent_filter(job.range.from, job.range.to).ok_or_else(|| {
                Error::Config(format!("{}: parent scan on non-factory source", job.source.name))
            })?
        } else {
            // Re-query the child set before each slice; it may have grown.
            let children = if job.source.is_factory() {
                self.resolver
                    .refresh_children(&job.source, self.cache.as_ref(), job.range.to)
                    .await?
            } else {
                Vec::new()
            };
            if job.source.is_factory() && children.is_empty() {
                // No children created yet anywhere in this range: coverage is
                // trivially complete.
                return self
                    .cache
                    .commit_slice(self.chain_id, &job.fingerprint, job.range, &[], &[], &[])
                    .await;
            }
            job.source.log_filter(job.range.from, job.range.to, &children)
        };

        let raw_logs = match self.client.get_logs(&filter).await {
            Ok(logs) => logs,
            Err(error) if error.is_range_limit() => {
                return match job.range.halve() {
                    Some((low, high)) => {
                        debug!(range = %job.range, "provider rejected span, halving");
                        run.enqueue(FetchTask::LogsSlice(SliceJob { range: low, ..job.clone() }));
                        run.enqueue(FetchTask::LogsSlice(SliceJob { range: high, ..job }));
                        Ok(())
                    }
                    // A single block that is still too large cannot shrink.
                    None => Err(error),
                };
            }
            Err(error) => return Err(error),
        };

        let mut logs = Vec::with_capacity(raw_logs.len());
        for raw in &raw_logs {
            logs.push(CachedLog::from_rpc(self.chain_id, raw)?);
        }
        logs.sort_by_key(|log| (log.block_number, log.log_index));
        EngineStats::add(&self.stats.logs_fetched, logs.len() as u64);

        let transactions: Vec<CachedTransaction> = {
            let mut txs: Vec<CachedTransaction> = logs.iter().map(CachedLog::transaction).collect();
            txs.sort_by_key(|t| t.hash);
            txs.dedup_by_key(|t| t.hash);
            txs
        };

        // Hydrate every referenced block not already cached.
        let mut missing: Vec<B256> = Vec::new();
        for log in &logs {
            if !missing.contains(&log.block_hash)
                && !self.cache.has_block(self.chain_id, log.block_hash).await?
            {
                missing.push(log.block_hash);
            }
        }

        if missing.is_empty() {
            return self
                .cache
                .commit_slice(
                    self.chain_id,
                    &job.fingerprint,
                    job.range,
                    &logs,
                    &[],
                    &transactions,
                )
                .await;
        }

        let state = Arc::new(SliceState {
            job,
            logs,
            transactions,
            blocks: Mutex::new(Vec::with_capacity(missing.len())),
            remaining: AtomicUsize::new(missing.len()),
        });
        for hash in missing {
            run.enqueue(FetchTask::BlockByHash { hash, state: Arc::clone(&state) });
        }
        Ok(())
    }

    /// Hydrate one block; the last block of a slice commits it.
    async fn process_block(&self, hash: B256, state: &Arc<SliceState>) -> Result<()> {
        let header = self.client.block_by_hash(hash).await?.ok_or_else(|| {
            Error::Decode(format!("block {hash:x} referenced by logs but not returned by provider"))
        })?;
        let block = CachedBlock {
            chain_id: self.chain_id,
            hash: header.hash,
            parent_hash: header.parent_hash,
            number: header.number,
            timestamp: header.timestamp,
        };
        EngineStats::add(&self.stats.blocks_hydrated, 1);
        state.blocks.lock().push(block);

        if state.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Interval commit happens only here, after every BlockByHash for
            // the slice has completed.
            let blocks = state.blocks.lock().clone();
            self.cache
                .commit_slice(
                    self.chain_id,
                    &state.job.fingerprint,
                    state.job.range,
                    &state.logs,
                    &blocks,
                    &state.transactions,
                )
                .await?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
