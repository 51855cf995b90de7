//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! defaults (schema.rs)
//!     → optional TOML file (loader.rs)
//!     → NSM_* environment variables (loader.rs)
//!     → validation.rs (semantic checks)
//!     → RegistryConfig (validated, immutable)
//!     → shared via Arc with the chain factory and supervisor
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; the supervisor only reads it
//! - All fields have defaults matching the deployed registry manifests
//! - Validation separates syntactic (serde/env parsing) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::ConfigError;
pub use schema::{
    ChainConfig, DiagnosticsConfig, IdentityConfig, KubeConfig, LogLevel, RegistryConfig,
    TelemetryConfig,
};
