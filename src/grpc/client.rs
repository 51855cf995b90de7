//! Dial options for outgoing registry calls.

use std::io;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tonic::metadata::MetadataValue;
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Request, Status};
use tower::Service;

use crate::identity::TokenGenerator;
use crate::net::{ListenUrl, MtlsConfig, RawStream, TlsError};

/// A channel whose every call carries a fresh bearer token.
pub type AuthenticatedChannel = InterceptedService<Channel, TokenInterceptor>;

/// How registry components dial their peers: mutual TLS with the process
/// SVID, plus a per-call JWT.
#[derive(Clone)]
pub struct DialOptions {
    connector: TlsConnector,
    tokens: Arc<dyn TokenGenerator>,
}

impl DialOptions {
    pub fn new(tls: &MtlsConfig, tokens: Arc<dyn TokenGenerator>) -> Result<Self, TlsError> {
        Ok(Self {
            connector: tls.connector()?,
            tokens,
        })
    }

    /// Connect and wait until the channel is established.
    pub async fn connect(
        &self,
        target: &ListenUrl,
    ) -> Result<AuthenticatedChannel, tonic::transport::Error> {
        let channel = endpoint(target)?
            .connect_with_connector(self.connector_for(target))
            .await?;
        Ok(self.intercept(channel))
    }

    /// Build a channel that connects on first use. Calls made before the
    /// peer is reachable wait for the connection.
    pub fn connect_lazy(
        &self,
        target: &ListenUrl,
    ) -> Result<AuthenticatedChannel, tonic::transport::Error> {
        let channel = endpoint(target)?.connect_with_connector_lazy(self.connector_for(target));
        Ok(self.intercept(channel))
    }

    pub fn token_interceptor(&self) -> TokenInterceptor {
        TokenInterceptor {
            tokens: Arc::clone(&self.tokens),
        }
    }

    fn intercept(&self, channel: Channel) -> AuthenticatedChannel {
        InterceptedService::new(channel, self.token_interceptor())
    }

    fn connector_for(&self, target: &ListenUrl) -> SvidConnector {
        SvidConnector {
            connector: self.connector.clone(),
            target: target.clone(),
        }
    }
}

/// Opens a mutual TLS stream to a fixed target, whatever URI tonic asks for.
#[derive(Clone)]
struct SvidConnector {
    connector: TlsConnector,
    target: ListenUrl,
}

impl Service<Uri> for SvidConnector {
    type Response = TokioIo<TlsStream<RawStream>>;
    type Error = io::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: Uri) -> Self::Future {
        let connector = self.connector.clone();
        let target = self.target.clone();
        Box::pin(async move {
            let server_name = match &target {
                ListenUrl::Tcp { host, .. } => host.clone(),
                ListenUrl::Unix(_) => "localhost".to_string(),
            };
            let server_name = ServerName::try_from(server_name)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let raw = RawStream::connect(&target).await?;
            let tls = connector.connect(server_name, raw).await?;
            Ok(TokioIo::new(tls))
        })
    }
}

fn endpoint(target: &ListenUrl) -> Result<Endpoint, tonic::transport::Error> {
    // The connector decides where to go; the URI only sets :authority.
    let authority = target
        .host_port()
        .unwrap_or_else(|| "localhost".to_string());
    Endpoint::from_shared(format!("http://{authority}"))
}

/// Adds `authorization: Bearer <jwt>` to every outgoing call.
#[derive(Clone)]
pub struct TokenInterceptor {
    tokens: Arc<dyn TokenGenerator>,
}

impl Interceptor for TokenInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let (token, _) = self
            .tokens
            .generate(None)
            .map_err(|e| Status::unauthenticated(format!("failed to generate token: {e}")))?;
        let value = MetadataValue::try_from(format!("Bearer {token}"))
            .map_err(|_| Status::internal("token is not valid metadata"))?;
        request.metadata_mut().insert("authorization", value);
        Ok(request)
    }
}
