//! End-to-end shallow reorg: follower, stream, and dispatcher repair the
//! cache, the user store, and the checkpoints down to the fork point.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use seine::cache::CacheStore;
use seine::dispatch::{ContractReader, Dispatcher, HandlerRegistry, MemoryRecordStore};
use seine::health::HealthState;
use seine::rpc::EthApi;
use seine::rpc::mock::{MockChain, block_hash};
use seine::sources::SourceResolver;
use seine::stats::EngineStats;
use seine::stream::{EventStream, LiveInput};
use seine::sync::LiveFollower;
use seine::types::{BlockNumber, ChainId, LogIndex};

use common::{RecordingHandler, memory_cache, network, static_source, transfer_log};

/// Wait until `predicate` holds or panic after a few seconds.
async fn eventually<F: Fn() -> bool>(what: &str, predicate: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn shallow_reorg_converges_to_the_new_chain() {
    let address = Address::from([0xA1; 20]);
    let net = network(1, 2);
    let source = static_source("Erc20", "mainnet", &net, address, 100);

    // Original chain: 99 empty, then one Transfer per block at 100 and 101.
    let chain = MockChain::new();
    chain.push_block(99, 99 * 12, 1, vec![]);
    chain.push_block(100, 100 * 12, 1, vec![transfer_log(&source, address, 1)]);
    chain.push_block(101, 101 * 12, 1, vec![transfer_log(&source, address, 2)]);

    let cache = memory_cache().await;
    let records = Arc::new(MemoryRecordStore::new());
    let handler = Arc::new(RecordingHandler::default());
    let resolver = Arc::new(SourceResolver::new(vec![Arc::clone(&source)]));
    let stats = Arc::new(EngineStats::new());
    let health = Arc::new(HealthState::new());
    let shutdown = CancellationToken::new();

    // Follower tails from block 100 (pure live run; no history).
    let client: Arc<dyn EthApi> = Arc::clone(&chain) as Arc<dyn EthApi>;
    let (live_tx, live_rx) = mpsc::channel(256);
    let follower = LiveFollower::new(
        ChainId::new(1),
        "mainnet",
        Arc::clone(&client),
        Arc::clone(&cache) as Arc<dyn CacheStore>,
        Arc::clone(&resolver),
        Arc::clone(&stats),
        vec![Arc::clone(&source)],
        2,
        Duration::from_millis(5),
        live_tx,
        Arc::clone(&health),
        BlockNumber::new(99),
    );
    let follower_task = tokio::spawn(follower.run(BlockNumber::new(100), shutdown.clone()));

    let (stream_tx, stream_rx) = mpsc::channel(256);
    let stream = EventStream::new(
        Arc::clone(&cache) as Arc<dyn CacheStore>,
        Arc::clone(&resolver),
        HashMap::new(),
        HashMap::new(),
        stream_tx,
    );
    let inputs =
        vec![LiveInput { network: "mainnet".into(), chain_id: ChainId::new(1), updates: live_rx }];
    let stream_task = tokio::spawn(stream.run(inputs, shutdown.clone()));

    let registry = HandlerRegistry::new().on("Erc20", "Transfer", Arc::clone(&handler) as _);
    let readers = HashMap::from([(
        "mainnet".to_owned(),
        Arc::new(ContractReader::new(ChainId::new(1), Arc::clone(&client))),
    )]);
    let dispatcher = Dispatcher::new(
        Arc::clone(&records) as Arc<dyn seine::dispatch::RecordStore>,
        Arc::clone(&cache) as Arc<dyn CacheStore>,
        Arc::clone(&resolver),
        registry,
        readers,
        HashMap::new(),
        Arc::clone(&stats),
        Arc::clone(&health),
    );
    let dispatcher_task = tokio::spawn(dispatcher.run(stream_rx, shutdown.clone()));

    // Both original events land in the store.
    {
        let records = Arc::clone(&records);
        eventually("original events", move || {
            records.peek("events", "Erc20:Transfer@100-0").is_some()
                && records.peek("events", "Erc20:Transfer@101-0").is_some()
        })
        .await;
    }

    // The chain switches to a fork: 101' has no log, 102' has one.
    chain.truncate_from(101);
    chain.push_block(101, 101 * 12, 2, vec![]);
    chain.push_block(102, 102 * 12, 2, vec![transfer_log(&source, address, 3)]);

    // Convergence: the new event arrives and the orphaned one is gone.
    {
        let records = Arc::clone(&records);
        eventually("post-reorg state", move || {
            records.peek("events", "Erc20:Transfer@102-0").is_some()
                && records.peek("events", "Erc20:Transfer@101-0").is_none()
        })
        .await;
    }

    shutdown.cancel();
    follower_task.await.expect("follower join").expect("follower");
    stream_task.await.expect("stream join").expect("stream");
    dispatcher_task.await.expect("dispatcher join").expect("dispatcher");

    // The surviving event from block 100 is untouched.
    assert!(records.peek("events", "Erc20:Transfer@100-0").is_some());

    // Cache reflects the new canonical chain only.
    assert!(cache.get_block(ChainId::new(1), block_hash(101, 1)).await.expect("cache").is_none());
    assert!(cache.get_block(ChainId::new(1), block_hash(101, 2)).await.expect("cache").is_some());
    assert!(cache.get_block(ChainId::new(1), block_hash(102, 2)).await.expect("cache").is_some());

    // Checkpoint advanced past the repaired segment.
    let cp = records.checkpoint("Erc20").expect("checkpoint");
    assert_eq!(cp.block_number, BlockNumber::new(102));
    assert_eq!(cp.log_index, LogIndex::new(0));

    // The durable mirror matches.
    let mirrored = cache
        .get_checkpoint(ChainId::new(1), "Erc20")
        .await
        .expect("cache checkpoint")
        .expect("present");
    assert_eq!(mirrored.block_number, BlockNumber::new(102));
}
