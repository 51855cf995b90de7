//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events, runtime level control)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Structured fields (`address`, `error`, `spiffe_id`) over formatted text
//! - Metrics are cheap and safe to record before an exporter exists

pub mod logging;
pub mod metrics;

pub use logging::LogLevelControl;
