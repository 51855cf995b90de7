//! Startup orchestration.
//!
//! # Responsibilities
//! - Derive TLS, tokens and dial options from the acquired identity
//! - Resolve policies and build the registry chain
//! - Start every listener and hand back the running server
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Steps run in order, not concurrently
//! - Listeners start last (traffic only when ready)

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::config::RegistryConfig;
use crate::grpc::{DialOptions, GrpcServer};
use crate::identity::{IdentityError, SpiffeJwtGenerator, TokenGenerator, X509Source};
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::supervisor;
use crate::net::{ListenerError, MtlsConfig, TlsError};
use crate::observability::metrics;
use crate::registry::{ChainContext, ChainError, PolicyError, PolicySet, RegistryChainFactory};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("error getting x509 source: {0}")]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("error resolving policies: {0}")]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// Bring the registry up on an already acquired identity.
///
/// Returns once every listener has been started; listener failures after
/// that point arrive through `shutdown`.
pub fn start(
    config: &RegistryConfig,
    source: Arc<dyn X509Source>,
    chain: &dyn RegistryChainFactory,
    shutdown: &Shutdown,
    started_at: Instant,
) -> Result<GrpcServer, StartupError> {
    let tls = MtlsConfig::new(Arc::clone(&source));
    let tokens: Arc<dyn TokenGenerator> = Arc::new(SpiffeJwtGenerator::new(
        source,
        config.max_token_lifetime,
    ));
    let dial = DialOptions::new(&tls, Arc::clone(&tokens))?;

    let server_policies = PolicySet::resolve(&config.registry_server_policies)?;
    let client_policies = PolicySet::resolve(&config.registry_client_policies)?;
    tracing::debug!(
        server = ?server_policies.files,
        client = ?client_policies.files,
        "Policies resolved"
    );

    let routes = chain.build(ChainContext {
        config: config.registry.clone(),
        tokens,
        server_policies,
        client_policies,
        dial,
        kube: (&config.kube).into(),
        shutdown: shutdown.clone(),
    })?;

    let server = GrpcServer::new(routes, &tls)?;
    supervisor::start_all(&config.listen_on, &server, shutdown)?;

    let elapsed = started_at.elapsed();
    metrics::record_startup(elapsed);
    tracing::info!("Startup completed in {:?}", elapsed);
    Ok(server)
}
