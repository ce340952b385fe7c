//! Shared fixtures for integration tests.
//!
//! Not every test binary uses every fixture.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use alloy::json_abi::JsonAbi;
use alloy::primitives::{Address, B256, Bytes};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use seine::cache::{CacheStore, SqlCacheStore};
use seine::config::{ContractConfig, FactoryConfig, FilterConfig, NetworkConfig};
use seine::dispatch::{
    ContractReader, Dispatcher, Handler, HandlerContext, HandlerRegistry, MemoryRecordStore,
    RecordTransaction as _,
};
use seine::error::Result;
use seine::health::HealthState;
use seine::rpc::EthApi;
use seine::rpc::mock::MockChain;
use seine::sources::{Source, SourceResolver};
use seine::stats::EngineStats;
use seine::stream::{EventStream, LiveInput};
use seine::sync::HistoricalFetcher;
use seine::types::{BlockNumber, ChainId, Checkpoint, Event};

pub const ERC20_ABI: &str = r#"[
    {
        "type": "event",
        "name": "Transfer",
        "inputs": [
            {"name": "id", "type": "uint256", "indexed": true},
            {"name": "to", "type": "address", "indexed": true}
        ],
        "anonymous": false
    }
]"#;

pub const FACTORY_ABI: &str = r#"[
    {
        "type": "event",
        "name": "ChildCreated",
        "inputs": [{"name": "child", "type": "address", "indexed": true}],
        "anonymous": false
    },
    {
        "type": "event",
        "name": "Ping",
        "inputs": [],
        "anonymous": false
    }
]"#;

pub fn abi(json: &str) -> JsonAbi {
    serde_json::from_str(json).expect("fixture ABI parses")
}

pub fn network(chain_id: u64, finality: u64) -> NetworkConfig {
    NetworkConfig {
        chain_id,
        transport: None,
        polling_interval_ms: 5,
        max_historical_task_concurrency: 4,
        finality_blocks: Some(finality),
        max_block_range: Some(1_000),
    }
}

/// A static source named `name` watching one address.
pub fn static_source(
    name: &str,
    net_name: &str,
    net: &NetworkConfig,
    address: Address,
    start_block: u64,
) -> Arc<Source> {
    let contract = ContractConfig {
        abi: "erc20.json".into(),
        network: net_name.into(),
        address: Some(format!("0x{}", hex::encode(address))),
        addresses: vec![],
        factory: None,
        filter: None,
        start_block,
        end_block: None,
        max_block_range: None,
    };
    Arc::new(Source::from_config(name, &contract, net, &abi(ERC20_ABI)).expect("static source"))
}

/// A factory source: parent emits `ChildCreated(address indexed child)`,
/// children emit `Ping()`.
pub fn factory_source(
    name: &str,
    net_name: &str,
    net: &NetworkConfig,
    parent: Address,
    start_block: u64,
) -> Arc<Source> {
    let contract = ContractConfig {
        abi: "factory.json".into(),
        network: net_name.into(),
        address: None,
        addresses: vec![],
        factory: Some(FactoryConfig {
            address: format!("0x{}", hex::encode(parent)),
            event: "ChildCreated".into(),
            parameter: "child".into(),
        }),
        filter: Some(FilterConfig { events: vec!["Ping".into()] }),
        start_block,
        end_block: None,
        max_block_range: None,
    };
    Arc::new(Source::from_config(name, &contract, net, &abi(FACTORY_ABI)).expect("factory source"))
}

pub fn topic_of(address: Address) -> B256 {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_slice());
    B256::from(word)
}

pub fn topic_of_u64(value: u64) -> B256 {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    B256::from(word)
}

pub async fn memory_cache() -> Arc<SqlCacheStore> {
    let cache = SqlCacheStore::connect("sqlite://:memory:").await.expect("in-memory cache");
    cache.migrate().await.expect("cache schema");
    Arc::new(cache)
}

/// Records the order of delivered events and mirrors them into the store.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    pub seen: Mutex<Vec<String>>,
}

impl RecordingHandler {
    pub fn order(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn handle(&self, event: &Event, ctx: &mut HandlerContext<'_>) -> Result<()> {
        let key = format!(
            "{}:{}@{}-{}",
            event.source_name,
            event.event_name,
            event.log.block_number,
            event.log.log_index
        );
        self.seen.lock().push(key.clone());
        ctx.db
            .create(
                "events",
                &key,
                serde_json::json!({
                    "source": event.source_name,
                    "event": event.event_name,
                    "block": event.log.block_number.value(),
                    "args": event.args,
                }),
            )
            .await
    }
}

/// Backfill every source, then replay the cache through the stream and
/// dispatcher to completion (no live phase).
pub async fn run_historical_pipeline(
    chains: &[(String, ChainId, Arc<MockChain>, BlockNumber)],
    sources: Vec<Arc<Source>>,
    registry: HandlerRegistry,
    cache: Arc<SqlCacheStore>,
    records: Arc<MemoryRecordStore>,
) {
    let resolver = Arc::new(SourceResolver::new(sources));
    let stats = Arc::new(EngineStats::new());

    let mut historical_end = HashMap::new();
    let mut readers = HashMap::new();
    for (name, chain_id, chain, finalized) in chains {
        let client: Arc<dyn EthApi> = Arc::clone(chain) as Arc<dyn EthApi>;
        let fetcher = Arc::new(HistoricalFetcher::new(
            *chain_id,
            name.clone(),
            Arc::clone(&client),
            Arc::clone(&cache) as Arc<dyn CacheStore>,
            Arc::clone(&resolver),
            Arc::clone(&stats),
            4,
        ));
        let net_sources: Vec<Arc<Source>> = resolver.sources_for_network(name);
        fetcher.backfill_all(&net_sources, *finalized).await.expect("backfill");

        historical_end.insert(name.clone(), *finalized);
        readers.insert(name.clone(), Arc::new(ContractReader::new(*chain_id, client)));
    }

    let mut checkpoints: HashMap<String, Checkpoint> = HashMap::new();
    for source in resolver.sources() {
        if let Some(cp) = cache
            .get_checkpoint(source.chain_id, &source.name)
            .await
            .expect("checkpoint load")
        {
            checkpoints.insert(source.name.clone(), cp);
        }
    }

    let (tx, rx) = mpsc::channel(256);
    let stream = EventStream::new(
        Arc::clone(&cache) as Arc<dyn CacheStore>,
        Arc::clone(&resolver),
        historical_end,
        checkpoints.clone(),
        tx,
    );
    let stream_task = tokio::spawn(stream.run(Vec::<LiveInput>::new(), CancellationToken::new()));

    let dispatcher = Dispatcher::new(
        records,
        Arc::clone(&cache) as Arc<dyn CacheStore>,
        resolver,
        registry,
        readers,
        checkpoints,
        stats,
        Arc::new(HealthState::new()),
    );
    dispatcher.run(rx, CancellationToken::new()).await.expect("dispatch");
    stream_task.await.expect("stream join").expect("stream");
}

/// Convenience: a Transfer mock log for the ERC20 fixture ABI.
pub fn transfer_log(source: &Source, address: Address, id: u64) -> seine::rpc::mock::MockLog {
    seine::rpc::mock::MockLog {
        address,
        topics: vec![
            source.selectors()[0],
            topic_of_u64(id),
            topic_of(Address::from([0x99; 20])),
        ],
        data: Bytes::new(),
    }
}
