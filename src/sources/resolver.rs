//! Source resolution: effective address sets and log filters.
//!
//! Static sources resolve to their configured addresses. Factory sources
//! resolve in two steps: the parent's creation-event range is synced into the
//! cache first (the historical fetcher treats the parent as a synthetic
//! static source), then the child address set is materialized by scanning the
//! cached parent logs. Child sets grow over time, so fetchers re-query them
//! before every range slice.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::json_abi::JsonAbi;
use alloy::primitives::Address;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::cache::CacheStore;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::sources::Source;
use crate::types::BlockNumber;

// ═══════════════════════════════════════════════════════════════════════════════
// SOURCE RESOLVER
// ═══════════════════════════════════════════════════════════════════════════════

/// Resolves configured sources into effective filters, materializing factory
/// child address sets from cached parent logs.
#[derive(Debug)]
pub struct SourceResolver {
    sources: Vec<Arc<Source>>,
    /// Materialized child sets per factory source, in discovery order.
    children: RwLock<HashMap<String, Vec<Address>>>,
}

impl SourceResolver {
    /// Build every source from settings, loading ABI files from disk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when an ABI file cannot be read or a source
    /// definition is invalid.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut sources = Vec::new();
        for (name, contract) in &settings.contracts {
            let network = settings.networks.get(&contract.network).ok_or_else(|| {
                Error::Config(format!("contract {name}: unknown network {}", contract.network))
            })?;
            let abi = load_abi(&contract.abi)?;
            sources.push(Arc::new(Source::from_config(name, contract, network, &abi)?));
        }
        info!(sources = sources.len(), "resolved event sources");
        Ok(Self::new(sources))
    }

    /// Build a resolver over pre-constructed sources.
    #[must_use]
    pub fn new(sources: Vec<Arc<Source>>) -> Self {
        Self { sources, children: RwLock::new(HashMap::new()) }
    }

    /// All configured sources.
    #[must_use]
    pub fn sources(&self) -> &[Arc<Source>] {
        &self.sources
    }

    /// Sources bound to the given network.
    #[must_use]
    pub fn sources_for_network(&self, network: &str) -> Vec<Arc<Source>> {
        self.sources.iter().filter(|s| s.network == network).cloned().collect()
    }

    /// The current materialized child set for a factory source.
    ///
    /// Empty for static sources and for factories with no children yet.
    #[must_use]
    pub fn children(&self, source_name: &str) -> Vec<Address> {
        self.children.read().get(source_name).cloned().unwrap_or_default()
    }

    /// Re-materialize a factory source's child set from cached parent logs
    /// in `[source.start_block, up_to]`.
    ///
    /// Children are appended in discovery order; already known children keep
    /// their position. Returns the refreshed set.
    ///
    /// # Errors
    ///
    /// Returns a cache error when the parent log scan fails.
    pub async fn refresh_children(
        &self,
        source: &Source,
        cache: &dyn CacheStore,
        up_to: BlockNumber,
    ) -> Result<Vec<Address>> {
        let Some(filter) = source.parent_filter(source.start_block, up_to) else {
            return Ok(Vec::new());
        };
        let Some(criteria) = source.factory() else {
            return Ok(Vec::new());
        };

        let parent_logs = cache.get_logs(source.chain_id, &filter).await?;

        let mut children = self.children.write();
        let known = children.entry(source.name.clone()).or_default();
        for log in &parent_logs {
            if let Some(child) = criteria.child_location.extract(&log.topics, &log.data) {
                if !known.contains(&child) {
                    debug!(
                        source = %source.name,
                        child = %child,
                        block = %log.block_number,
                        "discovered factory child"
                    );
                    known.push(child);
                }
            }
        }
        Ok(known.clone())
    }

    /// Record a child discovered from a live parent log.
    ///
    /// Returns true when the child was new.
    pub fn add_child(&self, source_name: &str, child: Address) -> bool {
        let mut children = self.children.write();
        let known = children.entry(source_name.to_owned()).or_default();
        if known.contains(&child) {
            false
        } else {
            known.push(child);
            true
        }
    }
}

/// Load and parse an ABI JSON file.
///
/// Accepts either a bare ABI array or a compiler artifact with an `abi` key.
///
/// # Errors
///
/// Returns [`Error::Config`] on read or parse failure.
pub fn load_abi(path: &str) -> Result<JsonAbi> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("abi file {path}: {e}")))?;
    parse_abi(&raw).map_err(|e| Error::Config(format!("abi file {path}: {e}")))
}

fn parse_abi(raw: &str) -> std::result::Result<JsonAbi, serde_json::Error> {
    serde_json::from_str::<JsonAbi>(raw).or_else(|bare_err| {
        #[derive(serde::Deserialize)]
        struct Artifact {
            abi: JsonAbi,
        }
        serde_json::from_str::<Artifact>(raw).map(|a| a.abi).map_err(|_| bare_err)
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn bare_abi_and_artifact_both_parse() {
        let bare = crate::sources::tests::ERC20_ABI;
        assert!(parse_abi(bare).is_ok());

        let artifact = format!(r#"{{"contractName": "Erc20", "abi": {bare}}}"#);
        assert!(parse_abi(&artifact).is_ok());
    }

    #[test]
    fn add_child_deduplicates() {
        let resolver = SourceResolver::new(vec![]);
        let child = Address::from([0xC1; 20]);
        assert!(resolver.add_child("Pool", child));
        assert!(!resolver.add_child("Pool", child));
        assert_eq!(resolver.children("Pool"), vec![child]);
    }
}
