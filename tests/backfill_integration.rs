//! End-to-end backfill scenarios: static sources, factory children, cache
//! reuse across restarts, and cross-chain ordering.

mod common;

use std::sync::Arc;

use alloy::primitives::{Address, Bytes};
use seine::cache::CacheStore as _;
use seine::dispatch::{HandlerRegistry, MemoryRecordStore};
use seine::rpc::mock::{MockChain, MockLog};
use seine::types::{BlockNumber, ChainId, LogIndex};

use common::{
    RecordingHandler, factory_source, memory_cache, network, run_historical_pipeline,
    static_source, topic_of, transfer_log,
};

/// One static source, three matching blocks: events dispatch in block order
/// and the checkpoint lands on the last one.
#[tokio::test]
async fn static_source_dispatches_in_order() {
    let address = Address::from([0xA1; 20]);
    let net = network(1, 0);
    let source = static_source("Erc20", "mainnet", &net, address, 100);

    let chain = MockChain::new();
    for (block, id) in [(100u64, 1u64), (101, 2), (102, 3)] {
        chain.push_block(block, block * 12, 1, vec![transfer_log(&source, address, id)]);
    }

    let cache = memory_cache().await;
    let records = Arc::new(MemoryRecordStore::new());
    let handler = Arc::new(RecordingHandler::default());
    let registry = HandlerRegistry::new().on("Erc20", "Transfer", Arc::clone(&handler) as _);

    run_historical_pipeline(
        &[("mainnet".into(), ChainId::new(1), Arc::clone(&chain), BlockNumber::new(102))],
        vec![Arc::clone(&source)],
        registry,
        Arc::clone(&cache),
        Arc::clone(&records),
    )
    .await;

    assert_eq!(
        handler.order(),
        vec!["Erc20:Transfer@100-0", "Erc20:Transfer@101-0", "Erc20:Transfer@102-0"]
    );
    let ids: Vec<String> = records
        .dump("events")
        .into_iter()
        .map(|(_, v)| v["args"]["id"].as_str().unwrap_or("?").to_owned())
        .collect();
    assert_eq!(ids, vec!["1", "2", "3"]);

    let cp = records.checkpoint("Erc20").expect("checkpoint committed");
    assert_eq!(cp.block_number, BlockNumber::new(102));
    assert_eq!(cp.log_index, LogIndex::new(0));
}

/// Factory scenario: children discovered from parent creation events, and
/// only their post-creation logs dispatch. A Ping from an unknown address
/// is ignored.
#[tokio::test]
async fn factory_children_are_discovered_and_filtered() {
    let parent = Address::from([0xF0; 20]);
    let child1 = Address::from([0xC1; 20]);
    let child2 = Address::from([0xC2; 20]);
    let stranger = Address::from([0xDD; 20]);

    let net = network(1, 0);
    let source = factory_source("Pools", "mainnet", &net, parent, 0);
    let abi = common::abi(common::FACTORY_ABI);
    let created = abi.events().find(|e| e.name == "ChildCreated").expect("abi").selector();
    let ping = abi.events().find(|e| e.name == "Ping").expect("abi").selector();

    let ping_log = |address: Address| MockLog { address, topics: vec![ping], data: Bytes::new() };

    let chain = MockChain::new();
    // Block 40: a Ping before any child exists - must be ignored.
    chain.push_block(40, 400, 1, vec![ping_log(stranger)]);
    // Block 50: child1 created.
    chain.push_block(
        50,
        500,
        1,
        vec![MockLog { address: parent, topics: vec![created, topic_of(child1)], data: Bytes::new() }],
    );
    // Block 60: child1 pings.
    chain.push_block(60, 600, 1, vec![ping_log(child1)]);
    // Block 80: child2 created.
    chain.push_block(
        80,
        800,
        1,
        vec![MockLog { address: parent, topics: vec![created, topic_of(child2)], data: Bytes::new() }],
    );
    // Block 90: child2 pings.
    chain.push_block(90, 900, 1, vec![ping_log(child2)]);

    let cache = memory_cache().await;
    let records = Arc::new(MemoryRecordStore::new());
    let handler = Arc::new(RecordingHandler::default());
    let registry = HandlerRegistry::new().on("Pools", "Ping", Arc::clone(&handler) as _);

    run_historical_pipeline(
        &[("mainnet".into(), ChainId::new(1), Arc::clone(&chain), BlockNumber::new(90))],
        vec![Arc::clone(&source)],
        registry,
        Arc::clone(&cache),
        Arc::clone(&records),
    )
    .await;

    assert_eq!(handler.order(), vec!["Pools:Ping@60-0", "Pools:Ping@90-0"]);
}

/// Cache reuse: a second run over the same range issues zero `eth_getLogs`
/// calls and reproduces the same final store state.
#[tokio::test]
async fn restart_replays_from_cache_without_rpc() {
    let address = Address::from([0xA1; 20]);
    let net = network(1, 0);
    let source = static_source("Erc20", "mainnet", &net, address, 100);

    let chain = MockChain::new();
    for (block, id) in [(100u64, 1u64), (101, 2), (102, 3)] {
        chain.push_block(block, block * 12, 1, vec![transfer_log(&source, address, id)]);
    }

    let cache = memory_cache().await;

    // First run.
    let records = Arc::new(MemoryRecordStore::new());
    let handler = Arc::new(RecordingHandler::default());
    let registry = HandlerRegistry::new().on("Erc20", "Transfer", Arc::clone(&handler) as _);
    run_historical_pipeline(
        &[("mainnet".into(), ChainId::new(1), Arc::clone(&chain), BlockNumber::new(102))],
        vec![Arc::clone(&source)],
        registry,
        Arc::clone(&cache),
        Arc::clone(&records),
    )
    .await;
    let first_state = records.dump("events");
    let calls_after_first = chain.get_logs_calls();

    // Simulated restart: same cache, fresh store, checkpoints wiped so the
    // cache replays from scratch.
    cache.delete_checkpoint(ChainId::new(1), "Erc20").await.expect("reset checkpoint");
    let records = Arc::new(MemoryRecordStore::new());
    let handler = Arc::new(RecordingHandler::default());
    let registry = HandlerRegistry::new().on("Erc20", "Transfer", Arc::clone(&handler) as _);
    run_historical_pipeline(
        &[("mainnet".into(), ChainId::new(1), Arc::clone(&chain), BlockNumber::new(102))],
        vec![Arc::clone(&source)],
        registry,
        Arc::clone(&cache),
        Arc::clone(&records),
    )
    .await;

    assert_eq!(chain.get_logs_calls(), calls_after_first, "no new eth_getLogs calls");
    assert_eq!(records.dump("events"), first_state, "replay reproduces the same state");
}

/// Resume: with a persisted checkpoint, only events above it re-dispatch.
#[tokio::test]
async fn resume_skips_checkpointed_events() {
    let address = Address::from([0xA1; 20]);
    let net = network(1, 0);
    let source = static_source("Erc20", "mainnet", &net, address, 100);

    let chain = MockChain::new();
    for (block, id) in [(100u64, 1u64), (101, 2), (102, 3)] {
        chain.push_block(block, block * 12, 1, vec![transfer_log(&source, address, id)]);
    }

    let cache = memory_cache().await;
    let records = Arc::new(MemoryRecordStore::new());
    let handler = Arc::new(RecordingHandler::default());
    let registry = HandlerRegistry::new().on("Erc20", "Transfer", Arc::clone(&handler) as _);
    run_historical_pipeline(
        &[("mainnet".into(), ChainId::new(1), Arc::clone(&chain), BlockNumber::new(102))],
        vec![Arc::clone(&source)],
        registry,
        Arc::clone(&cache),
        Arc::clone(&records),
    )
    .await;

    // Restart with the checkpoint still in place (fresh handler and store).
    let records = Arc::new(MemoryRecordStore::new());
    let handler = Arc::new(RecordingHandler::default());
    let registry = HandlerRegistry::new().on("Erc20", "Transfer", Arc::clone(&handler) as _);
    run_historical_pipeline(
        &[("mainnet".into(), ChainId::new(1), Arc::clone(&chain), BlockNumber::new(102))],
        vec![Arc::clone(&source)],
        registry,
        Arc::clone(&cache),
        Arc::clone(&records),
    )
    .await;

    assert!(handler.order().is_empty(), "everything was at or below the checkpoint");
}

/// Cross-chain ordering: timestamps dominate block numbers across chains.
#[tokio::test]
async fn cross_chain_events_interleave_by_timestamp() {
    let addr_a = Address::from([0xA1; 20]);
    let addr_b = Address::from([0xB1; 20]);
    let net_a = network(1, 0);
    let net_b = network(2, 0);
    let source_a = static_source("TokenA", "chain-a", &net_a, addr_a, 0);
    let source_b = static_source("TokenB", "chain-b", &net_b, addr_b, 0);

    // Chain A: block 10 ts=1000, block 11 ts=1002. Chain B: block 5 ts=1001.
    let chain_a = MockChain::new();
    chain_a.push_block(10, 1000, 1, vec![transfer_log(&source_a, addr_a, 1)]);
    chain_a.push_block(11, 1002, 1, vec![transfer_log(&source_a, addr_a, 2)]);
    let chain_b = MockChain::new();
    chain_b.push_block(5, 1001, 2, vec![transfer_log(&source_b, addr_b, 9)]);

    let cache = memory_cache().await;
    let records = Arc::new(MemoryRecordStore::new());
    let handler = Arc::new(RecordingHandler::default());
    let registry = HandlerRegistry::new()
        .on("TokenA", "Transfer", Arc::clone(&handler) as _)
        .on("TokenB", "Transfer", Arc::clone(&handler) as _);

    run_historical_pipeline(
        &[
            ("chain-a".into(), ChainId::new(1), chain_a, BlockNumber::new(11)),
            ("chain-b".into(), ChainId::new(2), chain_b, BlockNumber::new(5)),
        ],
        vec![source_a, source_b],
        registry,
        cache,
        records,
    )
    .await;

    assert_eq!(
        handler.order(),
        vec!["TokenA:Transfer@10-0", "TokenB:Transfer@5-0", "TokenA:Transfer@11-0"]
    );
}
