//! The merged, totally ordered event stream.
//!
//! Two phases feed the dispatcher through one bounded channel:
//!
//! 1. **Historical.** Each source's cached logs are scanned range by range
//!    and decoded; a k-way merge over per-source cursors emits events in the
//!    global order `(timestamp, chainId, blockNumber, txIndex, logIndex)`.
//! 2. **Live.** Per-network block updates arrive from the live followers.
//!    Every block advances its chain's *frontier* (the latest completed
//!    timestamp); a buffered event is released, in sorted order, once every
//!    other chain's frontier has moved past its timestamp, which makes the
//!    cross-chain interleave deterministic.
//!
//! Events at or below a source's checkpoint are suppressed in both phases, so
//! restarts and replays never re-deliver. Reorg notices travel in-band:
//! buffered events above the fork are dropped, then the notice is forwarded
//! so the dispatcher rolls back at the right point in the order.
//!
//! The output channel is bounded; when the dispatcher falls behind, the
//! stream (and transitively the followers) block instead of buffering
//! without limit.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::cache::CacheStore;
use crate::error::{Error, Result};
use crate::sources::{EventDecoder, Source, SourceResolver};
use crate::sync::LiveUpdate;
use crate::types::{
    BlockNumber, CachedBlock, CachedLog, ChainId, Checkpoint, Event, OrderKey, StreamItem,
};

/// Blocks per page when scanning cached history.
const HISTORY_PAGE_BLOCKS: u64 = 10_000;

// ═══════════════════════════════════════════════════════════════════════════════
// EVENT ASSEMBLY
// ═══════════════════════════════════════════════════════════════════════════════

/// Decode one cached log into a full event.
fn assemble(
    source: &Source,
    decoder: &EventDecoder,
    log: CachedLog,
    block: &CachedBlock,
) -> Result<Event> {
    let (event_name, args) = decoder.decode(&log)?;
    Ok(Event {
        source_name: source.name.clone(),
        event_name,
        args,
        transaction: log.transaction(),
        chain_id: source.chain_id,
        block: block.clone(),
        log,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// HISTORICAL FEED
// ═══════════════════════════════════════════════════════════════════════════════

/// Ordered cursor over one source's cached history.
struct HistoricalFeed {
    source: Arc<Source>,
    decoder: EventDecoder,
    children: Vec<alloy::primitives::Address>,
    cursor: BlockNumber,
    end: BlockNumber,
    buffer: std::collections::VecDeque<Event>,
    checkpoint: Option<Checkpoint>,
}

impl HistoricalFeed {
    /// Pull the next event in `(blockNumber, logIndex)` order.
    async fn next(&mut self, cache: &dyn CacheStore) -> Result<Option<Event>> {
        loop {
            if let Some(event) = self.buffer.pop_front() {
                return Ok(Some(event));
            }
            if self.cursor > self.end {
                return Ok(None);
            }
            let page_end =
                self.cursor.value().saturating_add(HISTORY_PAGE_BLOCKS - 1).min(self.end.value());
            let filter =
                self.source.log_filter(self.cursor, BlockNumber::new(page_end), &self.children);
            let logs = cache.get_logs(self.source.chain_id, &filter).await?;

            let mut blocks: HashMap<alloy::primitives::B256, CachedBlock> = HashMap::new();
            for log in logs {
                if self
                    .checkpoint
                    .as_ref()
                    .is_some_and(|cp| cp.covers((log.block_number, log.log_index)))
                {
                    continue;
                }
                let block = match blocks.get(&log.block_hash) {
                    Some(block) => block.clone(),
                    None => {
                        let block = cache
                            .get_block(self.source.chain_id, log.block_hash)
                            .await?
                            .ok_or_else(|| {
                                Error::Decode(format!(
                                    "cached log at {} references missing block {:x}",
                                    log.block_number, log.block_hash
                                ))
                            })?;
                        blocks.insert(log.block_hash, block.clone());
                        block
                    }
                };
                self.buffer.push_back(assemble(&self.source, &self.decoder, log, &block)?);
            }
            self.cursor = BlockNumber::new(page_end).next();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVENT STREAM
// ═══════════════════════════════════════════════════════════════════════════════

/// One network's live input to the stream.
#[derive(Debug)]
pub struct LiveInput {
    /// Network name.
    pub network: String,
    /// Chain id of that network.
    pub chain_id: ChainId,
    /// Updates from the network's live follower.
    pub updates: mpsc::Receiver<LiveUpdate>,
}

/// Merges historical and live events into one totally ordered stream.
pub struct EventStream {
    cache: Arc<dyn CacheStore>,
    resolver: Arc<SourceResolver>,
    /// Historical scan boundary per network (inclusive).
    historical_end: HashMap<String, BlockNumber>,
    /// Per-source checkpoints for replay suppression.
    checkpoints: HashMap<String, Checkpoint>,
    out: mpsc::Sender<StreamItem>,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("historical_end", &self.historical_end)
            .field("checkpoints", &self.checkpoints.len())
            .finish_non_exhaustive()
    }
}

impl EventStream {
    /// Create a stream.
    #[must_use]
    pub fn new(
        cache: Arc<dyn CacheStore>,
        resolver: Arc<SourceResolver>,
        historical_end: HashMap<String, BlockNumber>,
        checkpoints: HashMap<String, Checkpoint>,
        out: mpsc::Sender<StreamItem>,
    ) -> Self {
        Self { cache, resolver, historical_end, checkpoints, out }
    }

    /// Run both phases to completion (live runs until cancelled).
    ///
    /// # Errors
    ///
    /// Returns cache or decode errors, or [`Error::ChannelClosed`] when the
    /// dispatcher went away.
    #[instrument(skip_all)]
    pub async fn run(
        mut self,
        live_inputs: Vec<LiveInput>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        self.run_historical(&shutdown).await?;
        info!("historical stream drained, switching to live");
        self.run_live(live_inputs, &shutdown).await
    }

    /// Phase 1: k-way merge over per-source cached history.
    async fn run_historical(&mut self, shutdown: &CancellationToken) -> Result<()> {
        let mut feeds = Vec::new();
        for source in self.resolver.sources() {
            let Some(&end) = self.historical_end.get(&source.network) else { continue };
            if source.start_block > end {
                continue;
            }
            feeds.push(HistoricalFeed {
                decoder: EventDecoder::new(&source.events),
                children: self.resolver.children(&source.name),
                cursor: source.start_block,
                end: source.end_block.map_or(end, |e| e.min(end)),
                buffer: std::collections::VecDeque::new(),
                checkpoint: self.checkpoints.get(&source.name).cloned(),
                source: Arc::clone(source),
            });
        }

        // One buffered head per feed; repeatedly emit the minimum.
        let mut heads: Vec<Option<Event>> = Vec::with_capacity(feeds.len());
        for feed in &mut feeds {
            heads.push(feed.next(self.cache.as_ref()).await?);
        }

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            let Some(min_index) = heads
                .iter()
                .enumerate()
                .filter_map(|(i, head)| head.as_ref().map(|e| (i, e.order_key())))
                .min_by_key(|&(_, key)| key)
                .map(|(i, _)| i)
            else {
                return Ok(()); // every feed exhausted
            };

            let event = heads[min_index].take().ok_or(Error::ChannelClosed("merge head"))?;
            heads[min_index] = feeds[min_index].next(self.cache.as_ref()).await?;
            self.out
                .send(StreamItem::Event(Box::new(event)))
                .await
                .map_err(|_| Error::ChannelClosed("event stream output"))?;
        }
    }

    /// Phase 2: frontier-merged live updates.
    async fn run_live(
        &mut self,
        live_inputs: Vec<LiveInput>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let mut decoders: HashMap<String, EventDecoder> = HashMap::new();
        for source in self.resolver.sources() {
            decoders.insert(source.name.clone(), EventDecoder::new(&source.events));
        }

        let mut frontiers: HashMap<ChainId, u64> = HashMap::new();
        let mut buffer: BTreeMap<OrderKey, Event> = BTreeMap::new();
        let mut inputs = live_inputs;
        for input in &inputs {
            frontiers.insert(input.chain_id, 0);
        }

        loop {
            if inputs.is_empty() {
                // Followers gone: flush whatever is left, in order.
                for (_, event) in std::mem::take(&mut buffer) {
                    self.send_event(event).await?;
                }
                return Ok(());
            }

            // Wait for the next update from any follower.
            let (index, update) = {
                let polls = inputs
                    .iter_mut()
                    .enumerate()
                    .map(|(i, input)| Box::pin(async move { (i, input.updates.recv().await) }));
                tokio::select! {
                    () = shutdown.cancelled() => {
                        for (_, event) in std::mem::take(&mut buffer) {
                            self.send_event(event).await?;
                        }
                        return Ok(());
                    }
                    (result, _, _) = futures::future::select_all(polls) => result,
                }
            };

            match update {
                None => {
                    let input = inputs.swap_remove(index);
                    frontiers.remove(&input.chain_id);
                    debug!(net = %input.network, "live input closed");
                }
                Some(LiveUpdate::Reorg(notice)) => {
                    // Drop buffered events above the fork, then tell the
                    // dispatcher to roll back before anything newer flows.
                    buffer.retain(|key, _| {
                        key.chain_id != notice.chain_id || key.block_number < notice.from_block
                    });
                    self.out
                        .send(StreamItem::Reorg(notice))
                        .await
                        .map_err(|_| Error::ChannelClosed("event stream output"))?;
                }
                Some(LiveUpdate::Block { block, logs }) => {
                    let network = inputs[index].network.clone();
                    self.buffer_block_events(&network, &decoders, &block, logs, &mut buffer)?;
                    frontiers.insert(block.chain_id, block.timestamp);
                }
            }

            // Release the buffer prefix no other chain can still preempt.
            // An event is safe once every *other* chain's frontier is past
            // its timestamp (ties resolved by chain id, matching the total
            // order). Its own chain delivers in order by construction.
            loop {
                let Some((&key, _)) = buffer.first_key_value() else { break };
                let safe = frontiers.iter().all(|(&chain, &frontier)| {
                    chain == key.chain_id
                        || frontier > key.timestamp
                        || (frontier == key.timestamp && chain > key.chain_id)
                });
                if !safe {
                    break;
                }
                if let Some(event) = buffer.remove(&key) {
                    self.send_event(event).await?;
                }
            }
        }
    }

    /// Attribute a live block's logs to sources and buffer the events.
    fn buffer_block_events(
        &self,
        network: &str,
        decoders: &HashMap<String, EventDecoder>,
        block: &CachedBlock,
        logs: Vec<CachedLog>,
        buffer: &mut BTreeMap<OrderKey, Event>,
    ) -> Result<()> {
        for source in self.resolver.sources_for_network(network) {
            let Some(decoder) = decoders.get(&source.name) else { continue };
            let filter = source.log_filter(
                block.number,
                block.number,
                &self.resolver.children(&source.name),
            );
            for log in &logs {
                if !filter.matches(log.address, &log.topics, log.block_number) {
                    continue;
                }
                if self
                    .checkpoints
                    .get(&source.name)
                    .is_some_and(|cp| cp.covers((log.block_number, log.log_index)))
                {
                    continue;
                }
                let event = assemble(&source, decoder, log.clone(), block)?;
                buffer.insert(event.order_key(), event);
            }
        }
        Ok(())
    }

    async fn send_event(&self, event: Event) -> Result<()> {
        self.out
            .send(StreamItem::Event(Box::new(event)))
            .await
            .map_err(|_| Error::ChannelClosed("event stream output"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use alloy::primitives::{Address, B256, Bytes};

    use super::*;
    use crate::cache::{BlockRange, CacheStore as _, SqlCacheStore};
    use crate::config::{ContractConfig, NetworkConfig};
    use crate::sources::SourceResolver;
    use crate::types::LogIndex;

    fn source_on(name: &str, network: &str, chain_id: u64, address: u8) -> Arc<Source> {
        let abi = serde_json::from_str(crate::sources::tests::ERC20_ABI).unwrap();
        let net = NetworkConfig {
            chain_id,
            transport: None,
            polling_interval_ms: 5,
            max_historical_task_concurrency: 2,
            finality_blocks: Some(0),
            max_block_range: None,
        };
        let contract = ContractConfig {
            abi: "erc20.json".into(),
            network: network.into(),
            address: Some(format!("0x{}", hex::encode([address; 20]))),
            addresses: vec![],
            factory: None,
            filter: None,
            start_block: 0,
            end_block: None,
            max_block_range: None,
        };
        Arc::new(Source::from_config(name, &contract, &net, &abi).unwrap())
    }

    async fn seed_transfer(
        cache: &SqlCacheStore,
        source: &Source,
        block_number: u64,
        timestamp: u64,
        log_index: u64,
        tag: u8,
    ) {
        let block = CachedBlock {
            chain_id: source.chain_id,
            hash: B256::from([tag; 32]),
            parent_hash: B256::from([tag.wrapping_sub(1); 32]),
            number: BlockNumber::new(block_number),
            timestamp,
        };
        let mut topic_word = [0u8; 32];
        topic_word[12..].copy_from_slice(&[0x11; 20]);
        let log = CachedLog {
            chain_id: source.chain_id,
            address: match &source.kind {
                crate::sources::SourceKind::Static { addresses } => addresses[0],
                crate::sources::SourceKind::Factory(_) => Address::ZERO,
            },
            block_hash: block.hash,
            block_number: block.number,
            log_index: LogIndex::new(log_index),
            topics: vec![
                source.selectors()[0],
                B256::from(topic_word),
                B256::from(topic_word),
            ],
            data: Bytes::from(vec![0u8; 32]),
            transaction_hash: B256::from([tag ^ 0xFF; 32]),
            transaction_index: 0,
        };
        cache
            .commit_slice(
                source.chain_id,
                &source.fingerprint(),
                BlockRange::new(block_number, block_number),
                &[log],
                &[block],
                &[],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cross_chain_history_merges_by_timestamp() {
        let cache = SqlCacheStore::connect("sqlite://:memory:").await.unwrap();
        cache.migrate().await.unwrap();

        let a = source_on("A", "chain-a", 1, 0xA1);
        let b = source_on("B", "chain-b", 2, 0xB1);

        // Chain A block 10 ts=1000, chain B block 5 ts=1001, chain A block 11 ts=1002
        seed_transfer(&cache, &a, 10, 1000, 0, 0x0A).await;
        seed_transfer(&cache, &b, 5, 1001, 0, 0x0B).await;
        seed_transfer(&cache, &a, 11, 1002, 0, 0x1A).await;

        let resolver = Arc::new(SourceResolver::new(vec![Arc::clone(&a), Arc::clone(&b)]));
        let (tx, mut rx) = mpsc::channel(16);
        let stream = EventStream::new(
            Arc::new(cache),
            resolver,
            HashMap::from([
                ("chain-a".to_owned(), BlockNumber::new(100)),
                ("chain-b".to_owned(), BlockNumber::new(100)),
            ]),
            HashMap::new(),
            tx,
        );

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(stream.run(vec![], shutdown));

        let mut order = vec![];
        while let Some(item) = rx.recv().await {
            if let StreamItem::Event(event) = item {
                order.push((event.source_name.clone(), event.block.number.value()));
            }
        }
        task.await.unwrap().unwrap();

        assert_eq!(
            order,
            vec![("A".to_owned(), 10), ("B".to_owned(), 5), ("A".to_owned(), 11)]
        );
    }

    #[tokio::test]
    async fn checkpointed_events_are_suppressed() {
        let cache = SqlCacheStore::connect("sqlite://:memory:").await.unwrap();
        cache.migrate().await.unwrap();

        let a = source_on("A", "chain-a", 1, 0xA1);
        seed_transfer(&cache, &a, 10, 1000, 0, 0x0A).await;
        seed_transfer(&cache, &a, 11, 1002, 0, 0x1A).await;

        let resolver = Arc::new(SourceResolver::new(vec![Arc::clone(&a)]));
        let (tx, mut rx) = mpsc::channel(16);
        let checkpoint = Checkpoint {
            chain_id: ChainId::new(1),
            source_name: "A".into(),
            block_number: BlockNumber::new(10),
            log_index: LogIndex::new(0),
        };
        let stream = EventStream::new(
            Arc::new(cache),
            resolver,
            HashMap::from([("chain-a".to_owned(), BlockNumber::new(100))]),
            HashMap::from([("A".to_owned(), checkpoint)]),
            tx,
        );

        let task = tokio::spawn(stream.run(vec![], CancellationToken::new()));
        let mut blocks = vec![];
        while let Some(item) = rx.recv().await {
            if let StreamItem::Event(event) = item {
                blocks.push(event.block.number.value());
            }
        }
        task.await.unwrap().unwrap();
        assert_eq!(blocks, vec![11]);
    }

    #[tokio::test]
    async fn live_reorg_rolls_back_after_delivered_events() {
        let cache = SqlCacheStore::connect("sqlite://:memory:").await.unwrap();
        cache.migrate().await.unwrap();

        let a = source_on("A", "chain-a", 1, 0xA1);
        let resolver = Arc::new(SourceResolver::new(vec![Arc::clone(&a)]));
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (live_tx, live_rx) = mpsc::channel(16);

        let stream = EventStream::new(
            Arc::new(cache),
            resolver,
            HashMap::new(), // no history
            HashMap::new(),
            out_tx,
        );
        let inputs = vec![LiveInput {
            network: "chain-a".into(),
            chain_id: ChainId::new(1),
            updates: live_rx,
        }];
        let task = tokio::spawn(stream.run(inputs, CancellationToken::new()));

        // A block whose event stays buffered (frontier not yet advanced past it)
        let block = CachedBlock {
            chain_id: ChainId::new(1),
            hash: B256::from([0x10; 32]),
            parent_hash: B256::from([0x0F; 32]),
            number: BlockNumber::new(100),
            timestamp: 1000,
        };
        let mut topic_word = [0u8; 32];
        topic_word[12..].copy_from_slice(&[0x11; 20]);
        let log = CachedLog {
            chain_id: ChainId::new(1),
            address: Address::from([0xA1; 20]),
            block_hash: block.hash,
            block_number: block.number,
            log_index: LogIndex::new(0),
            topics: vec![
                a.selectors()[0],
                B256::from(topic_word),
                B256::from(topic_word),
            ],
            data: Bytes::from(vec![0u8; 32]),
            transaction_hash: B256::from([0xEF; 32]),
            transaction_index: 0,
        };
        live_tx.send(LiveUpdate::Block { block, logs: vec![log] }).await.unwrap();
        live_tx
            .send(LiveUpdate::Reorg(crate::types::ReorgNotice {
                chain_id: ChainId::new(1),
                from_block: BlockNumber::new(100),
            }))
            .await
            .unwrap();
        drop(live_tx);

        let mut items = vec![];
        while let Some(item) = out_rx.recv().await {
            items.push(item);
        }
        task.await.unwrap().unwrap();

        // Single chain: the event released immediately, then the notice
        // instructs the dispatcher to roll it back.
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], StreamItem::Event(_)));
        assert!(matches!(items[1], StreamItem::Reorg(_)));
    }

    #[tokio::test]
    async fn live_events_wait_for_lagging_chains() {
        let cache = SqlCacheStore::connect("sqlite://:memory:").await.unwrap();
        cache.migrate().await.unwrap();

        let a = source_on("A", "chain-a", 1, 0xA1);
        let b = source_on("B", "chain-b", 2, 0xB1);
        let resolver = Arc::new(SourceResolver::new(vec![Arc::clone(&a), Arc::clone(&b)]));
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (live_a_tx, live_a_rx) = mpsc::channel(16);
        let (live_b_tx, live_b_rx) = mpsc::channel(16);

        let stream =
            EventStream::new(Arc::new(cache), resolver, HashMap::new(), HashMap::new(), out_tx);
        let inputs = vec![
            LiveInput { network: "chain-a".into(), chain_id: ChainId::new(1), updates: live_a_rx },
            LiveInput { network: "chain-b".into(), chain_id: ChainId::new(2), updates: live_b_rx },
        ];
        let task = tokio::spawn(stream.run(inputs, CancellationToken::new()));

        let make_block = |chain: u64, number: u64, ts: u64, tag: u8| CachedBlock {
            chain_id: ChainId::new(chain),
            hash: B256::from([tag; 32]),
            parent_hash: B256::from([tag.wrapping_sub(1); 32]),
            number: BlockNumber::new(number),
            timestamp: ts,
        };
        let mut topic_word = [0u8; 32];
        topic_word[12..].copy_from_slice(&[0x11; 20]);
        let make_log = |source: &Source, address: u8, block: &CachedBlock| CachedLog {
            chain_id: block.chain_id,
            address: Address::from([address; 20]),
            block_hash: block.hash,
            block_number: block.number,
            log_index: LogIndex::new(0),
            topics: vec![source.selectors()[0], B256::from(topic_word), B256::from(topic_word)],
            data: Bytes::from(vec![0u8; 32]),
            transaction_hash: B256::from([0xEF; 32]),
            transaction_index: 0,
        };

        // Chain A produces an event at ts=1000; chain B is still at frontier
        // 0, so nothing is released yet.
        let block_a = make_block(1, 10, 1000, 0x10);
        let log_a = make_log(&a, 0xA1, &block_a);
        live_a_tx.send(LiveUpdate::Block { block: block_a, logs: vec![log_a] }).await.unwrap();

        // Chain B catches up past ts=1000 with an empty block; A's event
        // becomes safe and must come out first even though B sent later.
        let block_b = make_block(2, 5, 1001, 0x20);
        let log_b = make_log(&b, 0xB1, &block_b);
        live_b_tx.send(LiveUpdate::Block { block: block_b, logs: vec![log_b] }).await.unwrap();
        drop(live_a_tx);
        drop(live_b_tx);

        let mut order = vec![];
        while let Some(item) = out_rx.recv().await {
            if let StreamItem::Event(event) = item {
                order.push(event.source_name.clone());
            }
        }
        task.await.unwrap().unwrap();
        assert_eq!(order, vec!["A".to_owned(), "B".to_owned()]);
    }
}
