//! Network service mesh registry node backed by Kubernetes.
//!
//! The crate bootstraps a registry process: it loads configuration,
//! acquires the workload identity, derives mutual TLS and per-call tokens
//! from it, builds the registry chain and serves it on every configured
//! listener until a signal or the first listener failure ends the process.

// Core subsystems
pub mod config;
pub mod grpc;
pub mod identity;
pub mod net;
pub mod registry;

// Cross-cutting concerns
pub mod diagnostics;
pub mod lifecycle;
pub mod observability;

pub use config::RegistryConfig;
pub use lifecycle::{Shutdown, ShutdownCause};
pub use registry::{ChainContext, RegistryChainFactory};
