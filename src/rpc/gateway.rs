//! The production chain client: bounded, retrying, multi-transport.
//!
//! One gateway per network. All requests from the historical fetcher and the
//! live follower pass through the same [`tokio::sync::Semaphore`], so the
//! configured `max_historical_task_concurrency` bounds the network's total
//! in-flight request count regardless of which stage issued them.
//!
//! # Retry policy
//!
//! - Transport errors (connection refused, timeout, HTTP 429/5xx) are retried
//!   with exponential backoff plus jitter, up to `max_attempts`.
//! - Within one attempt, each configured transport is tried in priority
//!   order; a later transport is consulted only after the previous one failed
//!   at the transport level.
//! - Application-level error responses are returned to the caller unretried;
//!   the fetcher reacts to range-limit rejections by halving its span.

use std::sync::Arc;
use std::time::Duration;

use alloy::eips::{BlockId, BlockNumberOrTag};
use alloy::primitives::{Address, B256, Bytes, TxKind};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log, TransactionInput, TransactionRequest};
use alloy::transports::{RpcError, TransportResult};
use async_trait::async_trait;
use futures::future::BoxFuture;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::rpc::{EthApi, LogFilter};
use crate::stats::EngineStats;
use crate::types::{BlockNumber, BlockRef, ChainId};

// ═══════════════════════════════════════════════════════════════════════════════
// RETRY POLICY
// ═══════════════════════════════════════════════════════════════════════════════

/// Backoff and timeout knobs for the gateway.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts per logical request, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per attempt thereafter.
    pub base_delay: Duration,
    /// Cap on the computed backoff delay.
    pub max_delay: Duration,
    /// Upper bound of the uniform jitter added to every backoff delay.
    pub jitter: Duration,
    /// Per-call timeout; exceeding it counts as a transport failure.
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            jitter: Duration::from_millis(250),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before the given attempt (attempts count from 1).
    fn delay_before(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(2).min(16);
        let backoff = self.base_delay.saturating_mul(1 << exp).min(self.max_delay);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            backoff
        } else {
            backoff + Duration::from_millis(rand::rng().random_range(0..jitter_ms))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GATEWAY
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-network RPC gateway implementing [`EthApi`].
#[derive(Debug)]
pub struct RpcGateway {
    network: String,
    chain_id: ChainId,
    providers: Vec<DynProvider>,
    permits: Arc<Semaphore>,
    policy: RetryPolicy,
    stats: Arc<EngineStats>,
}

impl RpcGateway {
    /// Connect every configured transport and build the gateway.
    ///
    /// URLs are kept in priority order; HTTP and WebSocket endpoints are both
    /// accepted (the scheme selects the transport).
    ///
    /// # Errors
    ///
    /// Returns [`Error::RpcUnavailable`] when a transport cannot be
    /// established (WebSocket endpoints connect eagerly).
    pub async fn connect(
        network: impl Into<String>,
        chain_id: ChainId,
        urls: &[String],
        concurrency: usize,
        policy: RetryPolicy,
        stats: Arc<EngineStats>,
    ) -> Result<Self> {
        let network = network.into();
        let mut providers = Vec::with_capacity(urls.len());
        for url in urls {
            let provider = ProviderBuilder::new().connect(url).await.map_err(|e| {
                Error::RpcUnavailable {
                    network: network.clone(),
                    attempts: 1,
                    message: format!("connect {url}: {e}"),
                }
            })?;
            providers.push(provider.erased());
        }
        if providers.is_empty() {
            return Err(Error::Config(format!("network {network}: no transport URLs")));
        }

        Ok(Self {
            network,
            chain_id,
            providers,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            policy,
            stats,
        })
    }

    /// Chain id this gateway serves.
    #[must_use]
    pub const fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Network name this gateway serves.
    #[must_use]
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Run one logical request through the retry and fallback policy.
    async fn request<T>(
        &self,
        op: &'static str,
        build: impl Fn(DynProvider) -> BoxFuture<'static, TransportResult<T>> + Send + Sync,
    ) -> Result<T> {
        let mut last_message = String::from("no transports configured");

        for attempt in 1..=self.policy.max_attempts {
            if attempt > 1 {
                EngineStats::add(&self.stats.rpc_retries, 1);
                let delay = self.policy.delay_before(attempt);
                debug!(op, attempt, ?delay, net = %self.network, "retrying after backoff");
                tokio::time::sleep(delay).await;
            }

            for (transport, provider) in self.providers.iter().enumerate() {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| Error::ChannelClosed("rpc permit pool"))?;
                EngineStats::add(&self.stats.rpc_requests, 1);

                match timeout(self.policy.request_timeout, build(provider.clone())).await {
                    Ok(Ok(value)) => return Ok(value),
                    Ok(Err(RpcError::ErrorResp(payload))) => {
                        // Server answered; this is the caller's problem, not ours.
                        return Err(Error::RpcApplication {
                            code: payload.code,
                            message: payload.message.to_string(),
                        });
                    }
                    Ok(Err(err)) => {
                        last_message = err.to_string();
                        warn!(op, transport, attempt, net = %self.network, error = %last_message,
                              "transport failure");
                    }
                    Err(_) => {
                        last_message = format!("{op} timed out");
                        warn!(op, transport, attempt, net = %self.network, "request timed out");
                    }
                }
            }
        }

        Err(Error::RpcUnavailable {
            network: self.network.clone(),
            attempts: self.policy.max_attempts,
            message: last_message,
        })
    }
}

fn to_alloy_filter(filter: &LogFilter) -> Filter {
    let mut out =
        Filter::new().from_block(filter.from_block.value()).to_block(filter.to_block.value());
    if !filter.addresses.is_empty() {
        out = out.address(filter.addresses.clone());
    }
    if !filter.topic0.is_empty() {
        out = out.event_signature(filter.topic0.clone());
    }
    if let Some(t1) = filter.topics[0] {
        out = out.topic1(t1);
    }
    if let Some(t2) = filter.topics[1] {
        out = out.topic2(t2);
    }
    if let Some(t3) = filter.topics[2] {
        out = out.topic3(t3);
    }
    out
}

#[async_trait]
impl EthApi for RpcGateway {
    #[instrument(skip(self), fields(net = %self.network))]
    async fn block_number(&self) -> Result<BlockNumber> {
        let number = self
            .request("eth_blockNumber", |p| Box::pin(async move { p.get_block_number().await }))
            .await?;
        Ok(BlockNumber::new(number))
    }

    #[instrument(skip_all, fields(net = %self.network, from = %filter.from_block, to = %filter.to_block))]
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>> {
        let alloy_filter = to_alloy_filter(filter);
        self.request("eth_getLogs", move |p| {
            let f = alloy_filter.clone();
            Box::pin(async move { p.get_logs(&f).await })
        })
        .await
    }

    #[instrument(skip(self), fields(net = %self.network))]
    async fn block_by_number(&self, number: BlockNumber) -> Result<Option<BlockRef>> {
        let block = self
            .request("eth_getBlockByNumber", move |p| {
                Box::pin(async move {
                    p.get_block_by_number(BlockNumberOrTag::Number(number.value())).await
                })
            })
            .await?;
        Ok(block.map(|b| BlockRef::from_header(&b.header)))
    }

    #[instrument(skip(self), fields(net = %self.network))]
    async fn block_by_hash(&self, hash: B256) -> Result<Option<BlockRef>> {
        let block = self
            .request("eth_getBlockByHash", move |p| {
                Box::pin(async move { p.get_block_by_hash(hash).await })
            })
            .await?;
        Ok(block.map(|b| BlockRef::from_header(&b.header)))
    }

    #[instrument(skip(self, data), fields(net = %self.network, to = %to))]
    async fn call(&self, to: Address, data: Bytes, block: Option<BlockNumber>) -> Result<Bytes> {
        self.request("eth_call", move |p| {
            let tx = TransactionRequest {
                to: Some(TxKind::Call(to)),
                input: TransactionInput::new(data.clone()),
                ..Default::default()
            };
            Box::pin(async move {
                let call = p.call(tx);
                match block {
                    Some(b) => call.block(BlockId::number(b.value())).await,
                    None => call.await,
                }
            })
        })
        .await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
