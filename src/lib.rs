//! Seine: a streaming EVM event indexing engine.
//!
//! Given smart-contract event sources (static addresses or factory-derived
//! children, an ABI, a start block), seine produces a durable, totally
//! ordered stream of decoded events to user handler functions, which mutate
//! a record store behind a transactional context.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           ORCHESTRATOR                               │
//! │                                                                      │
//! │  ┌─────────────┐   ┌────────────────────┐   ┌─────────────────────┐ │
//! │  │ RPC Gateway │◀──│ Historical Fetcher │──▶│                     │ │
//! │  │ (per net)   │   └────────────────────┘   │     Cache Store     │ │
//! │  │             │   ┌────────────────────┐   │ (blocks/logs/txs/   │ │
//! │  │             │◀──│   Live Follower    │──▶│  intervals/ckpts)   │ │
//! │  └─────────────┘   └─────────┬──────────┘   └──────────┬──────────┘ │
//! │                              │ live blocks + reorgs    │ history    │
//! │                              ▼                         ▼            │
//! │                    ┌─────────────────────────────────────┐          │
//! │                    │    Event Stream (k-way ordered)     │          │
//! │                    └─────────────────┬───────────────────┘          │
//! │                                      ▼                              │
//! │                    ┌─────────────────────────────────────┐          │
//! │                    │  Dispatcher ──▶ handlers ──▶ store  │          │
//! │                    └─────────────────────────────────────┘          │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The cache survives restarts: committed coverage intervals mean a rerun
//! re-dispatches from disk without touching the RPC provider. The live
//! follower detects reorgs by parent-hash linkage and repairs cache, user
//! store, and checkpoints down to the fork point, bounded by the network's
//! finality depth.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod rpc;
pub mod sources;
pub mod stats;
pub mod stream;
pub mod sync;
pub mod types;

pub use error::{Error, ErrorKind, Result};
pub use orchestrator::Orchestrator;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    #[test]
    fn version_is_set() {
        assert!(!crate::VERSION.is_empty());
    }
}
