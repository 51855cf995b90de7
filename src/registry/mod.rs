//! Registry chain seam.
//!
//! The registry's storage and request handling live behind
//! [`RegistryChainFactory`]. This crate prepares everything a chain needs
//! (identity, tokens, policies, dial options, Kubernetes tuning) and serves
//! whatever routes the chain returns.

pub mod health;
pub mod policy;

use std::sync::Arc;

use thiserror::Error;
use tonic::service::Routes;

use crate::config::{ChainConfig, KubeConfig};
use crate::grpc::DialOptions;
use crate::identity::TokenGenerator;
use crate::lifecycle::shutdown::Shutdown;

pub use health::HealthChain;
pub use policy::{PolicyError, PolicySet};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("registry chain rejected its configuration: {0}")]
    Config(String),

    #[error("registry chain setup failed: {0}")]
    Setup(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Rate limits for the Kubernetes API client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KubeClientSettings {
    pub qps: f32,
    pub burst: u32,
}

impl From<&KubeConfig> for KubeClientSettings {
    fn from(config: &KubeConfig) -> Self {
        Self {
            qps: config.kubelet_qps as f32,
            burst: config.burst(),
        }
    }
}

/// Everything a registry chain is built from.
#[derive(Clone)]
pub struct ChainContext {
    pub config: ChainConfig,
    pub tokens: Arc<dyn TokenGenerator>,
    /// Policies for incoming registry calls.
    pub server_policies: PolicySet,
    /// Policies for calls the chain makes to other registries.
    pub client_policies: PolicySet,
    pub dial: DialOptions,
    pub kube: KubeClientSettings,
    /// Process lifetime; background work in the chain should stop with it.
    pub shutdown: Shutdown,
}

/// Builds the gRPC routes of a registry chain.
pub trait RegistryChainFactory: Send + Sync {
    fn build(&self, ctx: ChainContext) -> Result<Routes, ChainError>;
}
