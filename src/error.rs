//! Error types for the seine indexing engine.
//!
//! Errors are classified by recovery policy rather than by layer:
//!
//! - [`Error::Config`] - unrecoverable at startup
//! - [`Error::RpcUnavailable`] - transport failures, retried with backoff then fatal
//! - [`Error::RpcApplication`] - server-returned errors, surfaced to the caller
//!   (these drive range halving in the historical fetcher and are never retried)
//! - [`Error::Cache`] - cache database failures, retried then fatal
//! - [`Error::Handler`] - user handler failure, fatal by default
//! - [`Error::DeepReorg`] - reorg past the finality boundary, always fatal
//!
//! A chain reorganization within the finality window is *not* an error; it is
//! a control event carried on the event stream (see [`crate::types::events`]).

use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// ERROR KIND
// ═══════════════════════════════════════════════════════════════════════════════

/// Coarse error classification exposed by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid configuration.
    Config,
    /// RPC transport exhausted its retry budget.
    RpcUnavailable,
    /// RPC server returned an application-level error.
    RpcApplication,
    /// Cache database operation failed.
    CacheWrite,
    /// Log could not be decoded against the source ABI.
    Decode,
    /// User handler returned an error.
    Handler,
    /// Reorg deeper than the finality block count.
    DeepReorg,
    /// Internal invariant violation (closed channel, poisoned state).
    Internal,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ERROR
// ═══════════════════════════════════════════════════════════════════════════════

/// Engine error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid configuration, detected at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// An RPC transport failed after exhausting its retry budget.
    #[error("rpc unavailable on network {network} after {attempts} attempts: {message}")]
    RpcUnavailable {
        /// Network name the request was issued against.
        network: String,
        /// Number of attempts made, including the first.
        attempts: u32,
        /// Last transport error observed.
        message: String,
    },

    /// The RPC server returned an application-level error response.
    ///
    /// Not retried. The historical fetcher inspects these for range-limit
    /// rejections and halves the requested span.
    #[error("rpc application error (code {code}): {message}")]
    RpcApplication {
        /// JSON-RPC error code.
        code: i64,
        /// Server-provided message.
        message: String,
    },

    /// A cache database operation failed.
    #[error("cache error: {0}")]
    Cache(#[from] sqlx::Error),

    /// A log did not decode against the source's ABI.
    #[error("event decoding error: {0}")]
    Decode(String),

    /// A user handler returned an error after exhausting its retry policy.
    #[error("handler for {source_name}.{event_name} failed after {attempts} attempt(s): {message}")]
    Handler {
        /// Source the event belongs to.
        source_name: String,
        /// Event name the handler was registered for.
        event_name: String,
        /// Attempts made, including the first.
        attempts: u32,
        /// Handler-provided failure message.
        message: String,
    },

    /// A record-store operation was misused (duplicate create, missing id).
    ///
    /// Surfaces inside handlers; an unhandled one fails the event like any
    /// other handler error.
    #[error("record store error: {0}")]
    Store(String),

    /// The chain reorganized past the finality boundary.
    ///
    /// State at or below `finalized` is assumed immutable, so the engine
    /// cannot repair this automatically. Manual intervention required.
    #[error(
        "reorg on chain {chain_id} reaches block {fork_block}, below finalized block {finalized}"
    )]
    DeepReorg {
        /// Chain the reorg was observed on.
        chain_id: u64,
        /// First block of the diverging segment.
        fork_block: u64,
        /// Finality boundary at detection time.
        finalized: u64,
    },

    /// An inter-stage channel closed unexpectedly.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Graceful shutdown was requested.
    #[error("shutdown requested")]
    Shutdown,
}

impl Error {
    /// The coarse classification of this error, for the health endpoint.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::RpcUnavailable { .. } => ErrorKind::RpcUnavailable,
            Self::RpcApplication { .. } => ErrorKind::RpcApplication,
            Self::Cache(_) => ErrorKind::CacheWrite,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Store(_) | Self::Handler { .. } => ErrorKind::Handler,
            Self::DeepReorg { .. } => ErrorKind::DeepReorg,
            Self::ChannelClosed(_) | Self::Shutdown => ErrorKind::Internal,
        }
    }

    /// Process exit code for this error per the CLI contract.
    ///
    /// 0 is reserved for clean shutdown; configuration and handler failures
    /// exit 1; permanent RPC unavailability exits 2.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Shutdown => 0,
            Self::RpcUnavailable { .. } => 2,
            _ => 1,
        }
    }

    /// True when the error is a range-limit rejection from `eth_getLogs`.
    ///
    /// Providers phrase this differently; the match is deliberately loose.
    /// Code -32005 is the conventional "limit exceeded" JSON-RPC code.
    #[must_use]
    pub fn is_range_limit(&self) -> bool {
        match self {
            Self::RpcApplication { code, message } => {
                let m = message.to_ascii_lowercase();
                *code == -32005
                    || m.contains("block range")
                    || m.contains("range is too large")
                    || m.contains("too many blocks")
                    || m.contains("query returned more than")
                    || m.contains("log response size exceeded")
            }
            _ => false,
        }
    }
}

/// Type alias for engine Results.
pub type Result<T> = std::result::Result<T, Error>;

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
