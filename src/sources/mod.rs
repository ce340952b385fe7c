//! Event sources: static address sets and factory-derived children.
//!
//! A source binds a network, an ABI-selected event set, a block range, and
//! either a fixed address list or factory criteria. The source's
//! *fingerprint* keys the cache: intervals recorded under a fingerprint only
//! claim coverage for that exact filter criteria, so a config change starts
//! a fresh coverage set instead of trusting stale one.

use std::fmt;
use std::str::FromStr;

use alloy::json_abi::JsonAbi;
use alloy::primitives::{Address, B256, keccak256};

use crate::config::{ContractConfig, NetworkConfig};
use crate::error::{Error, Result};
use crate::rpc::LogFilter;
use crate::types::{BlockNumber, ChainId};

mod decode;
mod resolver;

pub use decode::EventDecoder;
pub use resolver::SourceResolver;

// ═══════════════════════════════════════════════════════════════════════════════
// CHILD LOCATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Where a factory's creation event carries the child address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildLocation {
    /// An indexed parameter: topic 1-3.
    Topic(usize),
    /// A byte offset into the non-indexed data region.
    DataOffset(usize),
}

impl ChildLocation {
    /// Resolve a parameter name to its extraction location.
    ///
    /// Indexed parameters occupy topics 1-3 in declaration order. Non-indexed
    /// parameters live in the data region; every fixed-size ABI type consumes
    /// 32 bytes, and a dynamic type consumes 32 bytes for its offset word.
    /// The parameter itself must be `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the parameter does not exist or is not
    /// an address.
    pub fn for_parameter(event: &alloy::json_abi::Event, parameter: &str) -> Result<Self> {
        let mut topic = 0usize;
        let mut offset = 0usize;

        for input in &event.inputs {
            if input.indexed {
                topic += 1;
                if input.name == parameter {
                    if input.ty != "address" {
                        return Err(Error::Config(format!(
                            "factory parameter {parameter} has type {}, expected address",
                            input.ty
                        )));
                    }
                    return Ok(Self::Topic(topic));
                }
            } else {
                if input.name == parameter {
                    if input.ty != "address" {
                        return Err(Error::Config(format!(
                            "factory parameter {parameter} has type {}, expected address",
                            input.ty
                        )));
                    }
                    return Ok(Self::DataOffset(offset));
                }
                // Fixed-size types consume 32 bytes; dynamic types consume
                // 32 bytes for their offset word.
                offset += 32;
            }
        }

        Err(Error::Config(format!(
            "factory parameter {parameter} not found in event {}",
            event.name
        )))
    }

    /// Extract the child address from a creation log's topics and data.
    #[must_use]
    pub fn extract(&self, topics: &[B256], data: &[u8]) -> Option<Address> {
        match self {
            Self::Topic(index) => {
                topics.get(*index).map(|word| Address::from_word(*word))
            }
            Self::DataOffset(offset) => {
                let word = data.get(*offset..*offset + 32)?;
                Some(Address::from_slice(&word[12..]))
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FACTORY CRITERIA
// ═══════════════════════════════════════════════════════════════════════════════

/// Factory-derived source criteria.
#[derive(Debug, Clone)]
pub struct FactoryCriteria {
    /// Parent (factory) contract address.
    pub address: Address,
    /// Creation event emitted per child.
    pub event: alloy::json_abi::Event,
    /// Where the child address lives in the creation event.
    pub child_location: ChildLocation,
}

// ═══════════════════════════════════════════════════════════════════════════════
// SOURCE
// ═══════════════════════════════════════════════════════════════════════════════

/// The address variant of a source.
#[derive(Debug, Clone)]
pub enum SourceKind {
    /// Fixed address set from configuration.
    Static {
        /// Lowercased 20-byte addresses.
        addresses: Vec<Address>,
    },
    /// Addresses derived at runtime from a parent's creation events.
    Factory(FactoryCriteria),
}

/// A configured event source bound to one network.
#[derive(Debug, Clone)]
pub struct Source {
    /// Source name (the contract key in configuration).
    pub name: String,
    /// Network name.
    pub network: String,
    /// Chain id of that network.
    pub chain_id: ChainId,
    /// Address variant.
    pub kind: SourceKind,
    /// The full contract ABI, exposed to handlers for read calls.
    pub abi: std::sync::Arc<JsonAbi>,
    /// Events to index, selected from the ABI.
    pub events: Vec<alloy::json_abi::Event>,
    /// First block to index.
    pub start_block: BlockNumber,
    /// Optional last block to index.
    pub end_block: Option<BlockNumber>,
    /// Span for one `eth_getLogs` slice.
    pub max_block_range: u64,
}

impl Source {
    /// Build a source from configuration and a parsed ABI.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unparseable addresses, an empty selected
    /// event set, or invalid factory criteria.
    pub fn from_config(
        name: &str,
        contract: &ContractConfig,
        network: &NetworkConfig,
        abi: &JsonAbi,
    ) -> Result<Self> {
        let selected: Vec<String> =
            contract.filter.as_ref().map(|f| f.events.clone()).unwrap_or_default();
        let mut events: Vec<alloy::json_abi::Event> = abi
            .events()
            .filter(|e| selected.is_empty() || selected.contains(&e.name))
            .cloned()
            .collect();
        events.sort_by(|a, b| a.selector().cmp(&b.selector()));
        if events.is_empty() {
            return Err(Error::Config(format!("contract {name}: no events selected from ABI")));
        }
        for wanted in &selected {
            if !events.iter().any(|e| &e.name == wanted) {
                return Err(Error::Config(format!(
                    "contract {name}: filtered event {wanted} not present in ABI"
                )));
            }
        }

        let kind = if let Some(factory) = &contract.factory {
            let event = abi
                .events()
                .find(|e| e.name == factory.event)
                .ok_or_else(|| {
                    Error::Config(format!(
                        "contract {name}: factory event {} not present in ABI",
                        factory.event
                    ))
                })?
                .clone();
            let child_location = ChildLocation::for_parameter(&event, &factory.parameter)?;
            SourceKind::Factory(FactoryCriteria {
                address: parse_address(name, &factory.address)?,
                event,
                child_location,
            })
        } else {
            let mut addresses = Vec::new();
            if let Some(address) = &contract.address {
                addresses.push(parse_address(name, address)?);
            }
            for address in &contract.addresses {
                addresses.push(parse_address(name, address)?);
            }
            addresses.sort_unstable();
            addresses.dedup();
            SourceKind::Static { addresses }
        };

        Ok(Self {
            name: name.to_owned(),
            network: contract.network.clone(),
            chain_id: ChainId::new(network.chain_id),
            kind,
            abi: std::sync::Arc::new(abi.clone()),
            events,
            start_block: BlockNumber::new(contract.start_block),
            end_block: contract.end_block.map(BlockNumber::new),
            max_block_range: contract.max_block_range.unwrap_or_else(|| network.block_range()),
        })
    }

    /// Selectors of the indexed events (topic0 values).
    #[must_use]
    pub fn selectors(&self) -> Vec<B256> {
        self.events.iter().map(alloy::json_abi::Event::selector).collect()
    }

    /// True when this source derives its addresses from a factory.
    #[must_use]
    pub const fn is_factory(&self) -> bool {
        matches!(self.kind, SourceKind::Factory(_))
    }

    /// Factory criteria, when present.
    #[must_use]
    pub const fn factory(&self) -> Option<&FactoryCriteria> {
        match &self.kind {
            SourceKind::Factory(criteria) => Some(criteria),
            SourceKind::Static { .. } => None,
        }
    }

    /// The log filter for this source over `range`.
    ///
    /// For factory sources, `children` is the materialized child set at call
    /// time; fetchers re-query it before each slice because the set can grow
    /// between requests.
    #[must_use]
    pub fn log_filter(
        &self,
        from_block: BlockNumber,
        to_block: BlockNumber,
        children: &[Address],
    ) -> LogFilter {
        let addresses = match &self.kind {
            SourceKind::Static { addresses } => addresses.clone(),
            SourceKind::Factory(_) => children.to_vec(),
        };
        LogFilter {
            from_block,
            to_block,
            addresses,
            topic0: self.selectors(),
            topics: [None; 3],
        }
    }

    /// The filter over the parent's creation events for a factory source.
    #[must_use]
    pub fn parent_filter(
        &self,
        from_block: BlockNumber,
        to_block: BlockNumber,
    ) -> Option<LogFilter> {
        self.factory().map(|criteria| LogFilter {
            from_block,
            to_block,
            addresses: vec![criteria.address],
            topic0: vec![criteria.event.selector()],
            topics: [None; 3],
        })
    }

    /// Cache fingerprint for this source's own event coverage.
    #[must_use]
    pub fn fingerprint(&self) -> SourceFingerprint {
        SourceFingerprint::of(self)
    }

    /// Cache fingerprint for the parent creation-event scan of a factory
    /// source.
    #[must_use]
    pub fn parent_fingerprint(&self) -> Option<SourceFingerprint> {
        self.factory().map(|criteria| {
            let mut preimage = String::from("factory-parent|");
            preimage.push_str(&format!("0x{}", hex::encode(criteria.address)));
            preimage.push('|');
            preimage.push_str(&format!("{:x}", criteria.event.selector()));
            SourceFingerprint::digest(&preimage)
        })
    }
}

fn parse_address(source: &str, value: &str) -> Result<Address> {
    Address::from_str(value)
        .map_err(|e| Error::Config(format!("contract {source}: bad address {value}: {e}")))
}

// ═══════════════════════════════════════════════════════════════════════════════
// FINGERPRINT
// ═══════════════════════════════════════════════════════════════════════════════

/// Stable hash of a source's filter criteria, used to key cached coverage.
///
/// Static sources hash their sorted address set and event selectors; factory
/// sources hash the parent criteria and child event selectors. The factory
/// fingerprint deliberately excludes the materialized child set: children
/// cannot emit logs before their creation block, and child-set discovery
/// always runs ahead of interval commits, so previously committed intervals
/// remain sound as the set grows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceFingerprint(String);

impl SourceFingerprint {
    fn of(source: &Source) -> Self {
        let mut preimage = String::new();
        match &source.kind {
            SourceKind::Static { addresses } => {
                preimage.push_str("static|");
                for address in addresses {
                    preimage.push_str(&format!("0x{}|", hex::encode(address)));
                }
            }
            SourceKind::Factory(criteria) => {
                preimage.push_str("factory|");
                preimage.push_str(&format!("0x{}|", hex::encode(criteria.address)));
                preimage.push_str(&format!("{:x}|", criteria.event.selector()));
                preimage.push_str(&format!("{:?}|", criteria.child_location));
            }
        }
        for selector in source.selectors() {
            preimage.push_str(&format!("{selector:x}|"));
        }
        Self::digest(&preimage)
    }

    fn digest(preimage: &str) -> Self {
        Self(format!("0x{}", hex::encode(keccak256(preimage.as_bytes()))))
    }

    /// Wrap a raw string as a fingerprint (test helper).
    #[must_use]
    pub fn from_raw(raw: &str) -> Self {
        Self(raw.to_owned())
    }

    /// The fingerprint as a string key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
