//! gRPC server over authenticated unix/TCP listeners.

use std::fmt;
use std::io;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::ReceiverStream;
use tonic::service::Routes;
use tonic::transport::Server;

use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::supervisor::ListenerService;
use crate::net::listener::is_transient_accept_error;
use crate::net::{BoundListener, ConnectionTracker, MeshStream, MtlsConfig, ServeError, TlsError};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const INCOMING_BACKLOG: usize = 64;

/// Serves the registry routes on every listener it is given.
#[derive(Clone)]
pub struct GrpcServer {
    routes: Routes,
    acceptor: TlsAcceptor,
    connections: ConnectionTracker,
}

impl GrpcServer {
    pub fn new(routes: Routes, tls: &MtlsConfig) -> Result<Self, TlsError> {
        Ok(Self {
            routes,
            acceptor: tls.acceptor()?,
            connections: ConnectionTracker::new(),
        })
    }

    /// Authenticated connections across all listeners.
    pub fn connections(&self) -> &ConnectionTracker {
        &self.connections
    }
}

impl fmt::Debug for GrpcServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcServer")
            .field("active_connections", &self.connections.active_count())
            .finish_non_exhaustive()
    }
}

impl ListenerService for GrpcServer {
    fn serve(
        &self,
        listener: BoundListener,
        shutdown: Shutdown,
    ) -> BoxFuture<'static, Result<(), ServeError>> {
        let routes = self.routes.clone();
        let acceptor = self.acceptor.clone();
        let connections = self.connections.clone();

        Box::pin(async move {
            let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_BACKLOG);

            let accept = accept_loop(listener, acceptor, connections, incoming_tx, shutdown.clone());
            let serve = Server::builder()
                .trace_fn(|request| {
                    tracing::info_span!("grpc", method = %request.uri().path())
                })
                .add_routes(routes)
                .serve_with_incoming_shutdown(
                    ReceiverStream::new(incoming_rx),
                    shutdown.cancelled_owned(),
                );
            tokio::pin!(accept);
            tokio::pin!(serve);

            tokio::select! {
                result = &mut serve => result.map_err(ServeError::from),
                result = &mut accept => match result {
                    // Stopped on shutdown; let the server drain.
                    Ok(()) => serve.await.map_err(ServeError::from),
                    Err(e) => Err(e),
                },
            }
        })
    }
}

async fn accept_loop(
    listener: BoundListener,
    acceptor: TlsAcceptor,
    connections: ConnectionTracker,
    incoming: mpsc::Sender<Result<MeshStream, io::Error>>,
    shutdown: Shutdown,
) -> Result<(), ServeError> {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };

        let (raw, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(e) if is_transient_accept_error(&e) => {
                tracing::debug!(listener = %listener.address(), error = %e, "Accept interrupted");
                continue;
            }
            Err(e) => return Err(ServeError::Accept(e)),
        };

        // Handshake off the accept path so a slow peer cannot stall it.
        let acceptor = acceptor.clone();
        let connections = connections.clone();
        let incoming = incoming.clone();
        let local = listener.address().clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(raw)).await {
                Ok(Ok(tls)) => {
                    let stream = MeshStream::new(tls, local, remote, connections.open());
                    let _ = incoming.send(Ok(stream)).await;
                }
                Ok(Err(e)) => {
                    tracing::debug!(listener = %local, peer = ?remote, error = %e, "TLS handshake failed")
                }
                Err(_) => {
                    tracing::debug!(listener = %local, peer = ?remote, "TLS handshake timed out")
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::identity::testing::TestPki;

    #[tokio::test]
    async fn debug_reports_live_connections() {
        let pki = TestPki::new();
        let tls = MtlsConfig::new(Arc::new(pki.issue("spiffe://example.org/registry").source(&pki)));
        let (_, health) = tonic_health::server::health_reporter();
        let server = GrpcServer::new(Routes::new(health), &tls).unwrap();

        let _slot = server.connections().open();
        assert_eq!(
            format!("{server:?}"),
            "GrpcServer { active_connections: 1, .. }"
        );
    }
}
