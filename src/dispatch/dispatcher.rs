//! The dispatcher: one handler at a time, in stream order, transactionally.
//!
//! For every event: open a record transaction, invoke the registered handler
//! with `(event, context)`, and commit the transaction together with the
//! per-source checkpoint. The checkpoint and the handler's mutations share
//! one transaction, giving exactly-once semantics at the checkpoint boundary.
//!
//! On a reorg notice at block `R`:
//!
//! 1. The in-flight handler has already drained (dispatch is sequential).
//! 2. The record store rewinds to the state as of the last event with
//!    `blockNumber < R` on the affected chain.
//! 3. Every affected source's checkpoint resets to the greatest
//!    `(blockNumber, logIndex)` strictly below `R`.
//! 4. Dispatch resumes; the follower re-delivers the replaced segment.
//!
//! A handler failure is fatal by default. A registration may opt into a
//! bounded retry; the same event is re-delivered with a fresh transaction.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::CacheStore;
use crate::dispatch::context::{ContractInfo, ContractReader, HandlerContext, NetworkInfo};
use crate::dispatch::store::{RecordStore, RecordTransaction as _};
use crate::error::{Error, Result};
use crate::health::HealthState;
use crate::sources::SourceResolver;
use crate::stats::EngineStats;
use crate::types::{Checkpoint, Event, ReorgNotice, StreamItem};

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLER PORT
// ═══════════════════════════════════════════════════════════════════════════════

/// A user event handler.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Process one event inside the dispatcher's transaction.
    async fn handle(&self, event: &Event, ctx: &mut HandlerContext<'_>) -> Result<()>;

    /// One-time per-source initialization, dispatched before the source's
    /// first real event in its own transaction. Advances no checkpoint.
    async fn setup(&self, _ctx: &mut HandlerContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// What to do when a handler returns an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Abort the transaction and stop the indexer (exit code 1).
    #[default]
    Fatal,
    /// Re-deliver the same event up to `max_attempts` times, then fail.
    Retry {
        /// Total attempts, including the first.
        max_attempts: u32,
    },
}

impl ErrorPolicy {
    const fn max_attempts(self) -> u32 {
        match self {
            Self::Fatal => 1,
            Self::Retry { max_attempts } => max_attempts,
        }
    }
}

struct Registration {
    handler: Arc<dyn Handler>,
    policy: ErrorPolicy,
}

/// Handler registrations keyed by `(source, event)`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), Registration>,
    setups: HashMap<String, Arc<dyn Handler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("setups", &self.setups.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `source.event` with the default (fatal)
    /// error policy.
    #[must_use]
    pub fn on(self, source: &str, event: &str, handler: Arc<dyn Handler>) -> Self {
        self.on_with_policy(source, event, handler, ErrorPolicy::Fatal)
    }

    /// Register a handler with an explicit error policy.
    #[must_use]
    pub fn on_with_policy(
        mut self,
        source: &str,
        event: &str,
        handler: Arc<dyn Handler>,
        policy: ErrorPolicy,
    ) -> Self {
        self.handlers
            .insert((source.to_owned(), event.to_owned()), Registration { handler, policy });
        self
    }

    /// Register a setup handler for a source.
    #[must_use]
    pub fn on_setup(mut self, source: &str, handler: Arc<dyn Handler>) -> Self {
        self.setups.insert(source.to_owned(), handler);
        self
    }

    fn get(&self, source: &str, event: &str) -> Option<&Registration> {
        self.handlers.get(&(source.to_owned(), event.to_owned()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DISPATCHER
// ═══════════════════════════════════════════════════════════════════════════════

/// Single-tasked event dispatcher.
pub struct Dispatcher {
    records: Arc<dyn RecordStore>,
    cache: Arc<dyn CacheStore>,
    resolver: Arc<SourceResolver>,
    registry: HandlerRegistry,
    readers: HashMap<String, Arc<ContractReader>>,
    contracts: HashMap<String, ContractInfo>,
    checkpoints: HashMap<String, Checkpoint>,
    setup_done: HashSet<String>,
    stats: Arc<EngineStats>,
    health: Arc<HealthState>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("checkpoints", &self.checkpoints)
            .field("setup_done", &self.setup_done)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher.
    ///
    /// `checkpoints` are the persisted cursors loaded at startup; events at
    /// or below them are skipped defensively even though the stream already
    /// suppresses them.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        records: Arc<dyn RecordStore>,
        cache: Arc<dyn CacheStore>,
        resolver: Arc<SourceResolver>,
        registry: HandlerRegistry,
        readers: HashMap<String, Arc<ContractReader>>,
        checkpoints: HashMap<String, Checkpoint>,
        stats: Arc<EngineStats>,
        health: Arc<HealthState>,
    ) -> Self {
        let contracts = resolver
            .sources()
            .iter()
            .map(|source| (source.name.clone(), ContractInfo::from_source(source)))
            .collect();
        Self {
            records,
            cache,
            resolver,
            registry,
            readers,
            contracts,
            checkpoints,
            setup_done: HashSet::new(),
            stats,
            health,
        }
    }

    /// Consume the stream until it ends or shutdown is requested.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handler`] when a handler exhausts its policy, or the
    /// underlying store/cache error.
    #[instrument(skip_all)]
    pub async fn run(
        mut self,
        mut stream: mpsc::Receiver<StreamItem>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        loop {
            let item = tokio::select! {
                // Drain in-flight work first; shutdown is checked between items.
                biased;
                item = stream.recv() => item,
                () = shutdown.cancelled() => {
                    info!("dispatcher stopping at clean checkpoint");
                    return Ok(());
                }
            };
            match item {
                None => {
                    info!("event stream ended");
                    return Ok(());
                }
                Some(StreamItem::Event(event)) => self.dispatch(*event).await?,
                Some(StreamItem::Reorg(notice)) => self.rollback(notice).await?,
            }
        }
    }

    /// Dispatch one event through its registered handler.
    async fn dispatch(&mut self, event: Event) -> Result<()> {
        // Replay guard: never re-execute at or below the checkpoint.
        if self
            .checkpoints
            .get(&event.source_name)
            .is_some_and(|cp| cp.covers(event.position()))
        {
            return Ok(());
        }

        if !self.setup_done.contains(&event.source_name) {
            self.run_setup(&event).await?;
        }

        let checkpoint = Checkpoint {
            chain_id: event.chain_id,
            source_name: event.source_name.clone(),
            block_number: event.log.block_number,
            log_index: event.log.log_index,
        };

        let Some(registration) = self.registry.get(&event.source_name, &event.event_name) else {
            // No handler: advance the cursor so replays stay aligned.
            let tx = self.records.begin().await?;
            tx.commit(Some(checkpoint.clone())).await?;
            return self.finish_event(&event, checkpoint).await;
        };
        let handler = Arc::clone(&registration.handler);
        let max_attempts = registration.policy.max_attempts();

        let reader = self
            .readers
            .get(&self.network_of(&event)?)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no reader for source {}", event.source_name)))?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut tx = self.records.begin().await?;
            let result = {
                let mut ctx = HandlerContext {
                    db: tx.as_mut(),
                    client: &reader,
                    network: NetworkInfo {
                        name: self.network_of(&event)?,
                        chain_id: event.chain_id,
                    },
                    contracts: &self.contracts,
                };
                handler.handle(&event, &mut ctx).await
            };

            match result {
                Ok(()) => {
                    tx.commit(Some(checkpoint.clone())).await?;
                    return self.finish_event(&event, checkpoint).await;
                }
                Err(error) if attempt < max_attempts => {
                    warn!(
                        source = %event.source_name,
                        event = %event.event_name,
                        attempt,
                        error = %error,
                        "handler failed, retrying"
                    );
                    tx.abort().await?;
                }
                Err(error) => {
                    tx.abort().await?;
                    return Err(Error::Handler {
                        source_name: event.source_name,
                        event_name: event.event_name,
                        attempts: attempt,
                        message: error.to_string(),
                    });
                }
            }
        }
    }

    /// Record a committed event everywhere it is tracked.
    async fn finish_event(&mut self, event: &Event, checkpoint: Checkpoint) -> Result<()> {
        // Mirror into the cache database for restart resume. Idempotent:
        // replays are suppressed by the checkpoint itself.
        self.cache.put_checkpoint(&checkpoint).await?;
        self.checkpoints.insert(event.source_name.clone(), checkpoint);
        self.health.set_dispatched(&self.network_of(event)?, event.log.block_number);
        EngineStats::add(&self.stats.events_dispatched, 1);
        debug!(
            source = %event.source_name,
            event = %event.event_name,
            block = %event.log.block_number,
            log = %event.log.log_index,
            "dispatched"
        );
        Ok(())
    }

    /// Run the setup pseudo-event for a source, in its own transaction.
    async fn run_setup(&mut self, event: &Event) -> Result<()> {
        self.setup_done.insert(event.source_name.clone());
        let Some(handler) = self.registry.setups.get(&event.source_name).cloned() else {
            return Ok(());
        };
        let reader = self
            .readers
            .get(&self.network_of(event)?)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no reader for source {}", event.source_name)))?;

        info!(source = %event.source_name, "running setup");
        let mut tx = self.records.begin().await?;
        let result = {
            let mut ctx = HandlerContext {
                db: tx.as_mut(),
                client: &reader,
                network: NetworkInfo { name: self.network_of(event)?, chain_id: event.chain_id },
                contracts: &self.contracts,
            };
            handler.setup(&mut ctx).await
        };
        match result {
            Ok(()) => tx.commit(None).await,
            Err(error) => {
                tx.abort().await?;
                Err(Error::Handler {
                    source_name: event.source_name.clone(),
                    event_name: "setup".into(),
                    attempts: 1,
                    message: error.to_string(),
                })
            }
        }
    }

    /// Roll back user state and checkpoints for a reorged chain segment.
    #[instrument(skip(self), fields(chain = %notice.chain_id, from = %notice.from_block))]
    async fn rollback(&mut self, notice: ReorgNotice) -> Result<()> {
        warn!("rolling back user store for reorg");
        self.records.rewind(notice.chain_id, notice.from_block).await?;

        for source in self.resolver.sources() {
            if source.chain_id != notice.chain_id {
                continue;
            }
            let affected = self
                .checkpoints
                .get(&source.name)
                .is_some_and(|cp| cp.block_number >= notice.from_block);
            if !affected {
                continue;
            }

            let filter = source.log_filter(
                source.start_block,
                notice.from_block.prev(),
                &self.resolver.children(&source.name),
            );
            match self
                .cache
                .latest_log_before(source.chain_id, &filter, notice.from_block)
                .await?
            {
                Some((block_number, log_index)) => {
                    let checkpoint = Checkpoint {
                        chain_id: source.chain_id,
                        source_name: source.name.clone(),
                        block_number,
                        log_index,
                    };
                    self.cache.put_checkpoint(&checkpoint).await?;
                    self.checkpoints.insert(source.name.clone(), checkpoint);
                }
                None => {
                    self.cache.delete_checkpoint(source.chain_id, &source.name).await?;
                    self.checkpoints.remove(&source.name);
                }
            }
        }
        Ok(())
    }

    fn network_of(&self, event: &Event) -> Result<String> {
        self.resolver
            .sources()
            .iter()
            .find(|s| s.name == event.source_name)
            .map(|s| s.network.clone())
            .ok_or_else(|| Error::Config(format!("unknown source {}", event.source_name)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
