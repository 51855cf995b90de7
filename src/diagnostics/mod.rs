//! Local diagnostics endpoint.
//!
//! `/healthz` answers 200 while the process is running and 503 once
//! shutdown has begun. `/status` reports identity, listeners and load.

pub mod handlers;

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::identity::SpiffeId;
use crate::lifecycle::Shutdown;
use crate::net::{ConnectionTracker, ListenUrl};

use self::handlers::{get_status, healthz};

/// What the endpoint reports. Identity and connection counts are filled in
/// as startup progresses.
#[derive(Clone)]
pub struct DiagnosticsState {
    inner: Arc<Inner>,
}

struct Inner {
    started_at: Instant,
    shutdown: Shutdown,
    listeners: Vec<ListenUrl>,
    spiffe_id: ArcSwapOption<SpiffeId>,
    connections: ArcSwapOption<ConnectionTracker>,
}

impl DiagnosticsState {
    pub fn new(shutdown: Shutdown, listeners: Vec<ListenUrl>) -> Self {
        Self {
            inner: Arc::new(Inner {
                started_at: Instant::now(),
                shutdown,
                listeners,
                spiffe_id: ArcSwapOption::empty(),
                connections: ArcSwapOption::empty(),
            }),
        }
    }

    pub fn set_spiffe_id(&self, id: SpiffeId) {
        self.inner.spiffe_id.store(Some(Arc::new(id)));
    }

    pub fn set_connections(&self, connections: ConnectionTracker) {
        self.inner.connections.store(Some(Arc::new(connections)));
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.inner.shutdown
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    pub fn spiffe_id(&self) -> Option<Arc<SpiffeId>> {
        self.inner.spiffe_id.load_full()
    }

    pub fn listeners(&self) -> &[ListenUrl] {
        &self.inner.listeners
    }

    pub fn active_connections(&self) -> u64 {
        self.inner
            .connections
            .load_full()
            .map(|tracker| tracker.active_count())
            .unwrap_or(0)
    }
}

pub fn router(state: DiagnosticsState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until shutdown.
pub async fn serve(listener: TcpListener, state: DiagnosticsState) -> io::Result<()> {
    let shutdown = state.shutdown().cancelled_owned();
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(address = %addr, "Diagnostics endpoint listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
