//! The orchestrator: wire the pipeline, track readiness, supervise tasks.
//!
//! Startup order:
//!
//! 1. Validate settings, open the cache, resolve sources.
//! 2. Connect one RPC gateway per network; observe each tip and compute the
//!    finality boundary.
//! 3. Start the live followers immediately (their delivery channels queue
//!    from the first post-finalized block, so nothing is missed while the
//!    backfill runs).
//! 4. Drain the historical fetchers for every source.
//! 5. Load persisted checkpoints, mark the engine ready, and start the event
//!    stream and dispatcher; the stream replays history in order, then
//!    unpauses the queued live inputs.
//!
//! Shutdown is a cancellation token: followers stop enqueueing, the stream
//! drains in-flight events, the dispatcher commits its current checkpoint
//! and exits. Historical slices abort without committing partial intervals.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::cache::{CacheStore, SqlCacheStore};
use crate::config::Settings;
use crate::dispatch::{ContractReader, Dispatcher, HandlerRegistry, RecordStore};
use crate::error::{Error, Result};
use crate::health::{self, HealthState};
use crate::rpc::{EthApi, RetryPolicy, RpcGateway};
use crate::sources::SourceResolver;
use crate::stats::EngineStats;
use crate::stream::{EventStream, LiveInput};
use crate::sync::{HistoricalFetcher, LiveFollower};
use crate::types::{BlockNumber, Checkpoint};

/// Capacity of each follower's delivery channel. Deliveries queue here while
/// the historical phase drains; the follower blocks when it fills.
const LIVE_CHANNEL_CAPACITY: usize = 4_096;

/// Capacity of the merged stream feeding the dispatcher.
const STREAM_CHANNEL_CAPACITY: usize = 1_024;

// ═══════════════════════════════════════════════════════════════════════════════
// ORCHESTRATOR
// ═══════════════════════════════════════════════════════════════════════════════

/// Composes and supervises the indexing pipeline.
pub struct Orchestrator {
    settings: Settings,
    registry: HandlerRegistry,
    records: Arc<dyn RecordStore>,
    stats: Arc<EngineStats>,
    health: Arc<HealthState>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("networks", &self.settings.networks.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Create an orchestrator over validated settings.
    #[must_use]
    pub fn new(
        settings: Settings,
        registry: HandlerRegistry,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            settings,
            registry,
            records,
            stats: Arc::new(EngineStats::new()),
            health: Arc::new(HealthState::new()),
        }
    }

    /// Engine counters (shared with the pipeline).
    #[must_use]
    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    /// Health state (shared with the endpoint).
    #[must_use]
    pub fn health(&self) -> Arc<HealthState> {
        Arc::clone(&self.health)
    }

    /// Run the pipeline until a fatal error or cancellation.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error of any stage. [`Error::Shutdown`] is
    /// never returned; cancellation resolves to `Ok(())`.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.settings.validate().map_err(|errors| Error::Config(errors.join("; ")))?;

        let cache: Arc<dyn CacheStore> =
            Arc::new(SqlCacheStore::connect(&self.settings.database_url()).await?);
        cache.migrate().await?;

        let resolver = Arc::new(SourceResolver::from_settings(&self.settings)?);

        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        // Health endpoint first; it reports not-ready until sync drains.
        let health_addr = self
            .settings
            .options
            .health_addr
            .parse()
            .map_err(|e| Error::Config(format!("options.health_addr: {e}")))?;
        tasks.spawn(health::serve(
            Arc::clone(&self.health),
            health_addr,
            self.settings.options.max_healthcheck_lag,
            shutdown.clone(),
        ));

        // Per-network gateways, tips, and finality boundaries.
        let mut clients: HashMap<String, Arc<dyn EthApi>> = HashMap::new();
        let mut readers: HashMap<String, Arc<ContractReader>> = HashMap::new();
        let mut finalized: HashMap<String, BlockNumber> = HashMap::new();
        for (name, network) in &self.settings.networks {
            let urls = network
                .transport
                .as_ref()
                .map(crate::config::TransportConfig::urls)
                .unwrap_or_default();
            let gateway = RpcGateway::connect(
                name.clone(),
                crate::types::ChainId::new(network.chain_id),
                &urls,
                network.max_historical_task_concurrency,
                RetryPolicy::default(),
                Arc::clone(&self.stats),
            )
            .await?;
            let client: Arc<dyn EthApi> = Arc::new(gateway);

            let tip = client.block_number().await?;
            let boundary = tip.saturating_sub(network.finality());
            self.health.set_tip(name, tip);
            info!(net = %name, %tip, finalized = %boundary, "network online");

            let reader = Arc::new(ContractReader::new(
                crate::types::ChainId::new(network.chain_id),
                Arc::clone(&client),
            ));
            reader.set_finalized(boundary);

            clients.insert(name.clone(), client);
            readers.insert(name.clone(), reader);
            finalized.insert(name.clone(), boundary);
        }

        // Live followers start now, in paused-delivery mode: their channels
        // queue blocks while the backfill runs.
        let mut live_inputs = Vec::new();
        for (name, network) in &self.settings.networks {
            let boundary = finalized[name];
            let (live_tx, live_rx) = mpsc::channel(LIVE_CHANNEL_CAPACITY);
            live_inputs.push(LiveInput {
                network: name.clone(),
                chain_id: crate::types::ChainId::new(network.chain_id),
                updates: live_rx,
            });

            let follower = LiveFollower::new(
                crate::types::ChainId::new(network.chain_id),
                name.clone(),
                Arc::clone(&clients[name]),
                Arc::clone(&cache),
                Arc::clone(&resolver),
                Arc::clone(&self.stats),
                resolver.sources_for_network(name),
                network.finality(),
                network.polling_interval(),
                live_tx,
                Arc::clone(&self.health),
                boundary,
            );
            let follower_shutdown = shutdown.clone();
            tasks.spawn(follower.run(boundary.next(), follower_shutdown));
        }

        // Historical drain, per network, concurrently.
        let mut backfills: JoinSet<Result<()>> = JoinSet::new();
        for (name, network) in &self.settings.networks {
            let fetcher = Arc::new(HistoricalFetcher::new(
                crate::types::ChainId::new(network.chain_id),
                name.clone(),
                Arc::clone(&clients[name]),
                Arc::clone(&cache),
                Arc::clone(&resolver),
                Arc::clone(&self.stats),
                network.max_historical_task_concurrency,
            ));
            let sources = resolver.sources_for_network(name);
            let boundary = finalized[name];
            backfills.spawn(async move { fetcher.backfill_all(&sources, boundary).await });
        }
        while let Some(joined) = backfills.join_next().await {
            joined.map_err(|e| Error::Config(format!("backfill task panicked: {e}")))??;
        }
        info!("historical backfill drained on every network");

        // Persisted checkpoints for replay suppression and resume.
        let mut checkpoints: HashMap<String, Checkpoint> = HashMap::new();
        for source in resolver.sources() {
            if let Some(cp) = cache.get_checkpoint(source.chain_id, &source.name).await? {
                checkpoints.insert(source.name.clone(), cp);
            }
        }
        self.health.set_ready();

        // Stream and dispatcher; the stream replays history then unpauses
        // the queued live inputs.
        let (stream_tx, stream_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let stream = EventStream::new(
            Arc::clone(&cache),
            Arc::clone(&resolver),
            finalized,
            checkpoints.clone(),
            stream_tx,
        );
        tasks.spawn(stream.run(live_inputs, shutdown.clone()));

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.records),
            Arc::clone(&cache),
            Arc::clone(&resolver),
            self.registry,
            readers,
            checkpoints,
            Arc::clone(&self.stats),
            Arc::clone(&self.health),
        );
        tasks.spawn(dispatcher.run(stream_rx, shutdown.clone()));

        // Supervise: the first fatal error cancels everything else.
        let mut outcome: Result<()> = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(Error::Config(format!("pipeline task panicked: {e}"))),
            };
            if let Err(error) = result {
                if !matches!(error, Error::Shutdown) && outcome.is_ok() {
                    error!(error = %error, "fatal pipeline error, shutting down");
                    self.health.set_error(error.kind());
                    outcome = Err(error);
                }
                shutdown.cancel();
            }
        }
        outcome
    }
}
