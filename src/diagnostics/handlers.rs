use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::diagnostics::DiagnosticsState;
use crate::lifecycle::ShutdownState;

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub state: &'static str,
    pub uptime_secs: u64,
    /// Unset while the SVID is still being issued.
    pub spiffe_id: Option<String>,
    pub listeners: Vec<String>,
    pub active_connections: u64,
}

pub async fn healthz(State(state): State<DiagnosticsState>) -> (StatusCode, &'static str) {
    match state.shutdown().state() {
        ShutdownState::Running => (StatusCode::OK, "ok"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "shutting down"),
    }
}

pub async fn get_status(State(state): State<DiagnosticsState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        state: state.shutdown().state().as_str(),
        uptime_secs: state.uptime().as_secs(),
        spiffe_id: state.spiffe_id().map(|id| id.to_string()),
        listeners: state.listeners().iter().map(ToString::to_string).collect(),
        active_connections: state.active_connections(),
    })
}
