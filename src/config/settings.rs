//! Settings structs and loading logic.
//!
//! Configuration is layered: `seine.toml` (or the file passed on the CLI),
//! then environment variables with the `SEINE_` prefix and `__` separator.
//! Two conventional environment variables are honored on top:
//!
//! - `DATABASE_URL` selects PostgreSQL when no `[database]` section is set
//! - `SEINE_RPC_URL_<chainId>` supplies a network's transport URL

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::types::ChainId;

// ═══════════════════════════════════════════════════════════════════════════════
// ROOT SETTINGS
// ═══════════════════════════════════════════════════════════════════════════════

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Networks keyed by a stable name.
    pub networks: BTreeMap<String, NetworkConfig>,
    /// Contract sources keyed by name.
    pub contracts: BTreeMap<String, ContractConfig>,
    /// Cache database selection. Falls back to `DATABASE_URL`, then to an
    /// embedded SQLite file.
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    /// Engine options.
    #[serde(default)]
    pub options: Options,
}

impl Settings {
    /// Load settings from a TOML file plus `SEINE_`-prefixed environment
    /// variables, then apply the conventional per-chain RPC variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or the contents do
    /// not deserialize.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut settings: Self = Config::builder()
            .add_source(File::from(path.as_ref()).required(true))
            .add_source(Environment::with_prefix("SEINE").separator("__").try_parsing(true))
            .build()?
            .try_deserialize()?;

        settings.apply_rpc_env();
        Ok(settings)
    }

    /// Fill in missing network transports from `SEINE_RPC_URL_<chainId>`.
    fn apply_rpc_env(&mut self) {
        for network in self.networks.values_mut() {
            if network.transport.is_none() {
                let var = format!("SEINE_RPC_URL_{}", network.chain_id);
                if let Ok(url) = std::env::var(&var) {
                    network.transport = Some(TransportConfig::Single(url));
                }
            }
        }
    }

    /// Resolve the cache database URL.
    ///
    /// Order: explicit `[database]` section, `DATABASE_URL` environment
    /// variable (PostgreSQL), embedded SQLite file `.seine/cache.db`.
    #[must_use]
    pub fn database_url(&self) -> String {
        if let Some(db) = &self.database {
            return db.url();
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            return url;
        }
        "sqlite://.seine/cache.db?mode=rwc".into()
    }

    /// Validate settings, collecting every problem before failing.
    ///
    /// # Errors
    ///
    /// Returns the list of validation error messages.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.networks.is_empty() {
            errors.push("at least one network must be configured".into());
        }
        for (name, network) in &self.networks {
            if network.transport.is_none() {
                errors.push(format!(
                    "network {name}: no transport configured and SEINE_RPC_URL_{} not set",
                    network.chain_id
                ));
            }
            if network.chain_id == 0 {
                errors.push(format!("network {name}: chain_id must be non-zero"));
            }
            if network.max_historical_task_concurrency == 0 {
                errors.push(format!(
                    "network {name}: max_historical_task_concurrency must be non-zero"
                ));
            }
        }

        if self.contracts.is_empty() {
            errors.push("at least one contract must be configured".into());
        }
        for (name, contract) in &self.contracts {
            if !self.networks.contains_key(&contract.network) {
                errors.push(format!("contract {name}: unknown network {}", contract.network));
            }
            let has_address = contract.address.is_some() || !contract.addresses.is_empty();
            match (&contract.factory, has_address) {
                (Some(_), true) => {
                    errors.push(format!("contract {name}: address and factory are exclusive"));
                }
                (None, false) => {
                    errors.push(format!("contract {name}: either address or factory is required"));
                }
                _ => {}
            }
            if let Some(factory) = &contract.factory {
                if factory.parameter.is_empty() {
                    errors.push(format!("contract {name}: factory.parameter must be set"));
                }
            }
            if let Some(end) = contract.end_block {
                if end < contract.start_block {
                    errors.push(format!("contract {name}: end_block precedes start_block"));
                }
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NETWORK
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-network configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// EVM chain id.
    pub chain_id: u64,
    /// Transport: one URL, or a prioritized fallback list.
    #[serde(default)]
    pub transport: Option<TransportConfig>,
    /// Interval between head polls when the transport cannot subscribe.
    #[serde(default = "defaults::polling_interval_ms")]
    pub polling_interval_ms: u64,
    /// Bound on concurrent historical tasks (shared by log and block fetches).
    #[serde(default = "defaults::max_historical_task_concurrency")]
    pub max_historical_task_concurrency: usize,
    /// Blocks behind the tip considered immutable. Defaults per chain.
    #[serde(default)]
    pub finality_blocks: Option<u64>,
    /// Default span for a single `eth_getLogs` query. Defaults per chain.
    #[serde(default)]
    pub max_block_range: Option<u64>,
}

impl NetworkConfig {
    /// Polling interval as a `Duration`.
    #[must_use]
    pub const fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    /// Finality depth, defaulted by chain when unset.
    #[must_use]
    pub fn finality(&self) -> u64 {
        self.finality_blocks.unwrap_or_else(|| default_finality(ChainId::new(self.chain_id)))
    }

    /// Log-query span, defaulted by chain when unset.
    #[must_use]
    pub fn block_range(&self) -> u64 {
        self.max_block_range.unwrap_or_else(|| default_block_range(ChainId::new(self.chain_id)))
    }
}

/// Transport selection: a single HTTP/WS URL or a fallback list where each
/// subsequent URL is tried only on transport-level failure.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TransportConfig {
    /// One endpoint; scheme selects HTTP or WebSocket.
    Single(String),
    /// Prioritized fallback list.
    Fallback(Vec<String>),
}

impl TransportConfig {
    /// The endpoint URLs in priority order.
    #[must_use]
    pub fn urls(&self) -> Vec<String> {
        match self {
            Self::Single(url) => vec![url.clone()],
            Self::Fallback(urls) => urls.clone(),
        }
    }
}

/// Finality depth defaults: 12 on mainnet, deeper elsewhere.
#[must_use]
pub fn default_finality(chain_id: ChainId) -> u64 {
    if chain_id.value() == 1 { 12 } else { 64 }
}

/// Log-query span defaults, with hints for known throttled providers.
///
/// Purely a performance default; the fetcher halves ranges the provider
/// rejects, so correctness never depends on this table.
#[must_use]
pub fn default_block_range(chain_id: ChainId) -> u64 {
    match chain_id.value() {
        // Arbitrum One: small blocks, providers tolerate wide spans
        42_161 => 10_000,
        // BSC public endpoints are ultra-limited
        56 => 800,
        // Polygon PoS
        137 => 3_000,
        _ => 2_000,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONTRACTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-contract source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ContractConfig {
    /// Path to the ABI JSON file.
    pub abi: String,
    /// Network name this contract lives on.
    pub network: String,
    /// Single static address (exclusive with `addresses` and `factory`).
    #[serde(default)]
    pub address: Option<String>,
    /// Multiple static addresses.
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Factory criteria producing child addresses at runtime.
    #[serde(default)]
    pub factory: Option<FactoryConfig>,
    /// Restrict indexing to a subset of the ABI's events.
    #[serde(default)]
    pub filter: Option<FilterConfig>,
    /// First block to index.
    #[serde(default)]
    pub start_block: u64,
    /// Optional last block to index.
    #[serde(default)]
    pub end_block: Option<u64>,
    /// Override the network's log-query span for this contract.
    #[serde(default)]
    pub max_block_range: Option<u64>,
}

/// Factory criteria: parent contract, creation event, and the event
/// parameter holding the child address.
#[derive(Debug, Clone, Deserialize)]
pub struct FactoryConfig {
    /// Parent (factory) contract address.
    pub address: String,
    /// Creation event name in the parent's ABI.
    pub event: String,
    /// Name of the event parameter carrying the child address.
    pub parameter: String,
}

/// Optional event filter.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    /// Event names to index; unset means every event in the ABI.
    #[serde(default)]
    pub events: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// DATABASE & OPTIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Cache database selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DatabaseConfig {
    /// Embedded SQLite file (development).
    Sqlite {
        /// Database file path.
        filename: String,
    },
    /// PostgreSQL server (production).
    Postgres {
        /// Connection string.
        connection_string: String,
    },
}

impl DatabaseConfig {
    /// The sqlx connection URL.
    #[must_use]
    pub fn url(&self) -> String {
        match self {
            Self::Sqlite { filename } => format!("sqlite://{filename}?mode=rwc"),
            Self::Postgres { connection_string } => connection_string.clone(),
        }
    }
}

/// Engine options.
#[derive(Debug, Clone, Deserialize)]
pub struct Options {
    /// Maximum blocks the dispatcher may lag the tip while still healthy.
    #[serde(default = "defaults::max_healthcheck_lag")]
    pub max_healthcheck_lag: u64,
    /// Address for the health endpoint.
    #[serde(default = "defaults::health_addr")]
    pub health_addr: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_healthcheck_lag: defaults::max_healthcheck_lag(),
            health_addr: defaults::health_addr(),
        }
    }
}

mod defaults {
    pub(super) const fn polling_interval_ms() -> u64 {
        1_000
    }
    pub(super) const fn max_historical_task_concurrency() -> usize {
        10
    }
    pub(super) const fn max_healthcheck_lag() -> u64 {
        50
    }
    pub(super) fn health_addr() -> String {
        "127.0.0.1:7979".into()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
