//! The context handed to user handlers.
//!
//! A handler receives `(event, context)`. The context exposes:
//!
//! - `db`: the open record transaction (committed with the checkpoint after
//!   the handler returns)
//! - `client`: read-only contract calls, cached when pinned to a finalized
//!   block
//! - `network`: the event's network name and chain id
//! - `contracts`: the configured contract surfaces (abi, address, range)

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use alloy::dyn_abi::{DynSolValue, FunctionExt, JsonAbiExt};
use alloy::json_abi::JsonAbi;
use alloy::primitives::{Address, Bytes};
use moka::future::Cache;

use crate::dispatch::store::RecordTransaction;
use crate::error::{Error, Result};
use crate::rpc::EthApi;
use crate::sources::{Source, SourceKind};
use crate::types::{BlockNumber, ChainId};

// ═══════════════════════════════════════════════════════════════════════════════
// NETWORK & CONTRACT INFO
// ═══════════════════════════════════════════════════════════════════════════════

/// The network an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Network name from configuration.
    pub name: String,
    /// Chain id.
    pub chain_id: ChainId,
}

/// A configured contract surface, as exposed to handlers.
#[derive(Debug, Clone)]
pub struct ContractInfo {
    /// The contract ABI.
    pub abi: Arc<JsonAbi>,
    /// Static address, when the source has exactly one.
    pub address: Option<Address>,
    /// First indexed block.
    pub start_block: BlockNumber,
    /// Last indexed block, when bounded.
    pub end_block: Option<BlockNumber>,
}

impl ContractInfo {
    /// Build from a resolved source.
    #[must_use]
    pub fn from_source(source: &Source) -> Self {
        let address = match &source.kind {
            SourceKind::Static { addresses } if addresses.len() == 1 => Some(addresses[0]),
            _ => None,
        };
        Self {
            abi: Arc::clone(&source.abi),
            address,
            start_block: source.start_block,
            end_block: source.end_block,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONTRACT READER
// ═══════════════════════════════════════════════════════════════════════════════

/// Read-only contract call client with finalized-result caching.
///
/// Results are cached by `(chainId, address, calldata, blockNumber)` but only
/// when the pinned block is at or below the finality boundary; unpinned and
/// unfinalized calls always hit the chain.
pub struct ContractReader {
    chain_id: ChainId,
    client: Arc<dyn EthApi>,
    finalized: AtomicU64,
    cache: Cache<(u64, Address, Bytes, u64), Bytes>,
}

impl std::fmt::Debug for ContractReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractReader")
            .field("chain_id", &self.chain_id)
            .field("finalized", &self.finalized.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ContractReader {
    /// Cached entries; finalized results are immutable so the cap is about
    /// memory, not staleness.
    const CACHE_CAPACITY: u64 = 16_384;

    /// Create a reader for one network.
    #[must_use]
    pub fn new(chain_id: ChainId, client: Arc<dyn EthApi>) -> Self {
        Self {
            chain_id,
            client,
            finalized: AtomicU64::new(0),
            cache: Cache::new(Self::CACHE_CAPACITY),
        }
    }

    /// Advance the finality boundary used for cache eligibility.
    pub fn set_finalized(&self, block: BlockNumber) {
        self.finalized.fetch_max(block.value(), Ordering::Relaxed);
    }

    /// Execute a read-only contract call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the function is not in the ABI,
    /// [`Error::Decode`] when arguments or the result do not match the
    /// signature, or the RPC error from the call itself.
    pub async fn read_contract(
        &self,
        abi: &JsonAbi,
        address: Address,
        function_name: &str,
        args: &[DynSolValue],
        block_number: Option<BlockNumber>,
    ) -> Result<Vec<DynSolValue>> {
        let function = abi
            .functions()
            .find(|f| f.name == function_name && f.inputs.len() == args.len())
            .ok_or_else(|| {
                Error::Config(format!(
                    "readContract: no function {function_name} with {} argument(s) in ABI",
                    args.len()
                ))
            })?;

        let calldata: Bytes = function
            .abi_encode_input(args)
            .map_err(|e| Error::Decode(format!("readContract {function_name}: {e}")))?
            .into();

        let cacheable = block_number
            .is_some_and(|block| block.value() <= self.finalized.load(Ordering::Relaxed));
        let key = (
            self.chain_id.value(),
            address,
            calldata.clone(),
            block_number.map_or(0, |block| block.value()),
        );

        let raw = if cacheable {
            if let Some(hit) = self.cache.get(&key).await {
                hit
            } else {
                let fetched = self.client.call(address, calldata, block_number).await?;
                self.cache.insert(key, fetched.clone()).await;
                fetched
            }
        } else {
            self.client.call(address, calldata, block_number).await?
        };

        function
            .abi_decode_output(&raw)
            .map_err(|e| Error::Decode(format!("readContract {function_name} output: {e}")))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLER CONTEXT
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything a handler may touch while processing one event.
pub struct HandlerContext<'a> {
    /// The open record transaction.
    pub db: &'a mut dyn RecordTransaction,
    /// Read-only chain access for the event's network.
    pub client: &'a ContractReader,
    /// The event's network.
    pub network: NetworkInfo,
    /// Configured contract surfaces by name.
    pub contracts: &'a HashMap<String, ContractInfo>,
}

impl std::fmt::Debug for HandlerContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("network", &self.network)
            .field("contracts", &self.contracts.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
