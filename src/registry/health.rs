//! Default chain: the standard gRPC health service.

use tonic::service::Routes;
use tonic_health::ServingStatus;

use crate::registry::{ChainContext, ChainError, RegistryChainFactory};

/// Serves `grpc.health.v1.Health` and reports NOT_SERVING once shutdown
/// begins.
#[derive(Debug, Default, Clone, Copy)]
pub struct HealthChain;

impl RegistryChainFactory for HealthChain {
    fn build(&self, ctx: ChainContext) -> Result<Routes, ChainError> {
        if ctx.config.namespace.is_empty() {
            return Err(ChainError::Config("namespace must not be empty".to_string()));
        }
        tracing::info!(
            namespace = %ctx.config.namespace,
            proxy_registry = ?ctx.config.proxy_registry_url.as_ref().map(|u| u.as_str()),
            server_policies = ctx.server_policies.files.len(),
            client_policies = ctx.client_policies.files.len(),
            kube_qps = ctx.kube.qps,
            kube_burst = ctx.kube.burst,
            "Building registry chain"
        );

        let (reporter, service) = tonic_health::server::health_reporter();
        let shutdown = ctx.shutdown;
        tokio::spawn(async move {
            reporter.set_service_status("", ServingStatus::Serving).await;
            shutdown.cancelled().await;
            reporter
                .set_service_status("", ServingStatus::NotServing)
                .await;
        });

        Ok(Routes::new(service))
    }
}
