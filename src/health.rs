//! Engine health: per-network lag tracking and the HTTP endpoint.
//!
//! Healthy means every network's dispatcher cursor is within
//! `max_healthcheck_lag` blocks of that network's tip, and no fatal error
//! has been recorded. Readiness flips once every source's historical range
//! has drained.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{Error, ErrorKind, Result};
use crate::types::BlockNumber;

// ═══════════════════════════════════════════════════════════════════════════════
// HEALTH STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Shared health signals, written by the pipeline and read by the endpoint.
#[derive(Debug, Default)]
pub struct HealthState {
    tips: RwLock<HashMap<String, u64>>,
    dispatched: RwLock<HashMap<String, u64>>,
    last_error: RwLock<Option<ErrorKind>>,
    ready: AtomicBool,
}

impl HealthState {
    /// Fresh, not-ready state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a network's observed tip.
    pub fn set_tip(&self, network: &str, tip: BlockNumber) {
        self.tips.write().insert(network.to_owned(), tip.value());
    }

    /// Record a network's last dispatched block.
    pub fn set_dispatched(&self, network: &str, block: BlockNumber) {
        self.dispatched.write().insert(network.to_owned(), block.value());
    }

    /// Record a fatal error kind for the report.
    pub fn set_error(&self, kind: ErrorKind) {
        *self.last_error.write() = Some(kind);
    }

    /// Mark historical sync as drained.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }

    /// Build the current report.
    #[must_use]
    pub fn report(&self, max_lag: u64) -> HealthReport {
        let tips = self.tips.read().clone();
        let dispatched = self.dispatched.read().clone();

        let mut networks: Vec<NetworkHealth> = tips
            .iter()
            .map(|(name, &tip)| {
                let last = dispatched.get(name).copied();
                let lag = last.map_or(tip, |block| tip.saturating_sub(block));
                NetworkHealth { network: name.clone(), tip, last_dispatched: last, lag }
            })
            .collect();
        networks.sort_by(|a, b| a.network.cmp(&b.network));

        let ready = self.ready.load(Ordering::Relaxed);
        let last_error = *self.last_error.read();
        let healthy =
            ready && last_error.is_none() && networks.iter().all(|n| n.lag <= max_lag);

        HealthReport { healthy, ready, networks, last_error }
    }
}

/// Per-network health line.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkHealth {
    /// Network name.
    pub network: String,
    /// Observed tip.
    pub tip: u64,
    /// Last dispatched block, if any.
    pub last_dispatched: Option<u64>,
    /// Blocks between tip and cursor.
    pub lag: u64,
}

/// The health endpoint payload.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall verdict.
    pub healthy: bool,
    /// Historical sync drained.
    pub ready: bool,
    /// Per-network detail.
    pub networks: Vec<NetworkHealth>,
    /// Kind of the last fatal error, if one occurred.
    pub last_error: Option<ErrorKind>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENDPOINT
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
struct EndpointState {
    health: Arc<HealthState>,
    max_lag: u64,
}

async fn health_handler(State(state): State<EndpointState>) -> impl IntoResponse {
    let report = state.health.report(state.max_lag);
    let status =
        if report.healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(report))
}

/// Serve `GET /health` until cancelled.
///
/// # Errors
///
/// Returns [`Error::Config`] when the address cannot be bound.
pub async fn serve(
    health: Arc<HealthState>,
    addr: SocketAddr,
    max_lag: u64,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = axum::Router::new()
        .route("/health", get(health_handler))
        .with_state(EndpointState { health, max_lag });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Config(format!("health endpoint bind {addr}: {e}")))?;
    info!(%addr, "health endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Config(format!("health endpoint: {e}")))
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unready_state_is_unhealthy() {
        let state = HealthState::new();
        assert!(!state.report(50).healthy);
    }

    #[test]
    fn lag_within_bound_is_healthy() {
        let state = HealthState::new();
        state.set_ready();
        state.set_tip("mainnet", BlockNumber::new(1_000));
        state.set_dispatched("mainnet", BlockNumber::new(990));
        assert!(state.report(50).healthy);
        assert!(!state.report(5).healthy);
    }

    #[test]
    fn errors_make_it_unhealthy() {
        let state = HealthState::new();
        state.set_ready();
        state.set_error(ErrorKind::RpcUnavailable);
        let report = state.report(50);
        assert!(!report.healthy);
        assert_eq!(report.last_error, Some(ErrorKind::RpcUnavailable));
    }
}
