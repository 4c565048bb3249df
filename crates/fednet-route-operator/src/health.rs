//! Health check HTTP server for Kubernetes probes.
//!
//! Provides `/healthz` (liveness) and `/readyz` (readiness) endpoints.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::firewall::iptables::IptablesOps;

/// Built-in chain queried by the readiness probe
const PROBE_TABLE: &str = "filter";
const PROBE_CHAIN: &str = "INPUT";

/// Shared state for health check endpoints.
pub struct HealthState {
    /// Whether the agent has completed startup.
    started: AtomicBool,
    /// Packet-filter backend probed for readiness.
    iptables: Arc<dyn IptablesOps>,
}

impl HealthState {
    pub fn new(iptables: Arc<dyn IptablesOps>) -> Self {
        Self {
            started: AtomicBool::new(false),
            iptables,
        }
    }

    /// Mark the agent as started and ready.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
        info!("Health check: agent marked as started");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

/// Run the health check HTTP server.
///
/// Runs until the server encounters a fatal error. The agent is marked as
/// started only after the listener is bound.
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> std::io::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state.clone());

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = port, "Health check server listening");

    state.mark_started();

    axum::serve(listener, app).await
}

/// Liveness probe: 200 while the process is alive.
async fn healthz() -> StatusCode {
    debug!("Liveness probe: OK");
    StatusCode::OK
}

/// Readiness probe.
///
/// Returns 503 until startup completes, and whenever the iptables backend
/// cannot answer a query for a built-in chain.
async fn readyz(State(state): State<Arc<HealthState>>) -> StatusCode {
    if !state.is_started() {
        debug!("Readiness probe: NOT READY (startup incomplete)");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    match state.iptables.chain_exists(PROBE_TABLE, PROBE_CHAIN).await {
        Ok(true) => {
            debug!("Readiness probe: OK");
            StatusCode::OK
        }
        Ok(false) => {
            warn!(
                table = PROBE_TABLE,
                chain = PROBE_CHAIN,
                "Readiness probe: NOT READY (built-in chain missing)"
            );
            StatusCode::SERVICE_UNAVAILABLE
        }
        Err(e) => {
            warn!(error = %e, "Readiness probe: NOT READY (iptables unavailable)");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
