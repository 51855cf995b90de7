//! Mutual TLS from the workload identity.
//!
//! Both directions present the current SVID and verify the peer's chain
//! against the current trust bundle. Material is looked up per handshake,
//! so a rotated SVID or bundle applies to the next connection.

use std::fmt;
use std::sync::{Arc, Mutex};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ResolvesClientCert;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ParsedCertificate, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{
    ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig,
    SignatureScheme,
};
use thiserror::Error;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::identity::{SpiffeId, TrustBundle, X509Source, X509Svid};

const ALPN_H2: &[u8] = b"h2";

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Builds client and server TLS settings from one identity source.
#[derive(Clone)]
pub struct MtlsConfig {
    source: Arc<dyn X509Source>,
    provider: Arc<CryptoProvider>,
}

impl MtlsConfig {
    pub fn new(source: Arc<dyn X509Source>) -> Self {
        Self {
            source,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    /// Server side: client certificates are mandatory.
    pub fn server_config(&self) -> Result<ServerConfig, TlsError> {
        let verifier = SpiffeClientVerifier {
            source: Arc::clone(&self.source),
            provider: Arc::clone(&self.provider),
        };
        let mut config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
            .with_client_cert_verifier(Arc::new(verifier))
            .with_cert_resolver(Arc::new(SvidResolver::new(
                Arc::clone(&self.source),
                Arc::clone(&self.provider),
            )));
        config.alpn_protocols = vec![ALPN_H2.to_vec()];
        Ok(config)
    }

    /// Client side: the server's chain is checked against the bundle, its
    /// host name is not.
    pub fn client_config(&self) -> Result<ClientConfig, TlsError> {
        let verifier = SpiffeServerVerifier {
            source: Arc::clone(&self.source),
            provider: Arc::clone(&self.provider),
        };
        let mut config = ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_cert_resolver(Arc::new(SvidResolver::new(
                Arc::clone(&self.source),
                Arc::clone(&self.provider),
            )));
        config.alpn_protocols = vec![ALPN_H2.to_vec()];
        Ok(config)
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor, TlsError> {
        Ok(TlsAcceptor::from(Arc::new(self.server_config()?)))
    }

    pub fn connector(&self) -> Result<TlsConnector, TlsError> {
        Ok(TlsConnector::from(Arc::new(self.client_config()?)))
    }
}

impl fmt::Debug for MtlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MtlsConfig")
            .field("spiffe_id", self.source.svid().id())
            .finish_non_exhaustive()
    }
}

/// Serves the current SVID to both sides of the handshake.
struct SvidResolver {
    source: Arc<dyn X509Source>,
    provider: Arc<CryptoProvider>,
    // Signing key loaded for the last SVID seen.
    cached: Mutex<Option<(Arc<X509Svid>, Arc<CertifiedKey>)>>,
}

impl SvidResolver {
    fn new(source: Arc<dyn X509Source>, provider: Arc<CryptoProvider>) -> Self {
        Self {
            source,
            provider,
            cached: Mutex::new(None),
        }
    }

    fn certified_key(&self) -> Option<Arc<CertifiedKey>> {
        let svid = self.source.svid();
        let mut cached = self.cached.lock().ok()?;
        if let Some((seen, key)) = cached.as_ref() {
            if Arc::ptr_eq(seen, &svid) {
                return Some(Arc::clone(key));
            }
        }

        let signing_key = match self.provider.key_provider.load_private_key(svid.private_key()) {
            Ok(key) => key,
            Err(e) => {
                tracing::error!(spiffe_id = %svid.id(), error = %e, "Unusable SVID private key");
                return None;
            }
        };
        let key = Arc::new(CertifiedKey::new(svid.cert_chain().to_vec(), signing_key));
        *cached = Some((svid, Arc::clone(&key)));
        Some(key)
    }
}

impl fmt::Debug for SvidResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SvidResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SvidResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.certified_key()
    }
}

impl ResolvesClientCert for SvidResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.certified_key()
    }

    fn has_certs(&self) -> bool {
        true
    }
}

fn root_store(bundle: &TrustBundle) -> Result<RootCertStore, rustls::Error> {
    let mut roots = RootCertStore::empty();
    for cert in bundle.roots() {
        roots.add(cert.clone())?;
    }
    Ok(roots)
}

fn require_spiffe_id(end_entity: &CertificateDer<'_>) -> Result<SpiffeId, rustls::Error> {
    SpiffeId::from_certificate(end_entity)
        .map_err(|e| rustls::Error::General(format!("peer certificate rejected: {e}")))
}

/// Accepts any server whose chain leads to the trust bundle and which
/// carries a SPIFFE ID.
#[derive(Debug)]
struct SpiffeServerVerifier {
    source: Arc<dyn X509Source>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for SpiffeServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let roots = root_store(&self.source.bundle())?;
        let cert = ParsedCertificate::try_from(end_entity)?;
        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &cert,
            &roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )?;
        let id = require_spiffe_id(end_entity)?;
        tracing::trace!(peer_id = %id, "Server certificate verified");
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Requires a client certificate chained to the current trust bundle.
#[derive(Debug)]
struct SpiffeClientVerifier {
    source: Arc<dyn X509Source>,
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for SpiffeClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let roots = root_store(&self.source.bundle())?;
        let webpki =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&self.provider))
                .build()
                .map_err(|e| rustls::Error::General(e.to_string()))?;
        let verified = webpki.verify_client_cert(end_entity, intermediates, now)?;
        let id = require_spiffe_id(end_entity)?;
        tracing::trace!(peer_id = %id, "Client certificate verified");
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::testing::TestPki;
    use crate::net::{BoundListener, ListenUrl, RawStream};

    fn mtls(pki: &TestPki, id: &str) -> MtlsConfig {
        MtlsConfig::new(Arc::new(pki.issue(id).source(pki)))
    }

    #[test]
    fn configs_offer_h2() {
        let pki = TestPki::new();
        let config = mtls(&pki, "spiffe://example.org/registry");
        assert_eq!(config.server_config().unwrap().alpn_protocols, vec![b"h2".to_vec()]);
        assert_eq!(config.client_config().unwrap().alpn_protocols, vec![b"h2".to_vec()]);
    }

    async fn handshake(server: &MtlsConfig, client: &MtlsConfig) -> Result<Option<SpiffeId>, std::io::Error> {
        let listener = BoundListener::bind(&ListenUrl::tcp("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let acceptor = server.acceptor().unwrap();
        let connector = client.connector().unwrap();

        let accept = tokio::spawn(async move {
            let (raw, _) = listener.accept().await?;
            let tls = acceptor.accept(raw).await?;
            Ok::<_, std::io::Error>(
                tls.get_ref()
                    .1
                    .peer_certificates()
                    .and_then(|c| c.first())
                    .and_then(|leaf| SpiffeId::from_certificate(leaf).ok()),
            )
        });

        let raw = RawStream::connect(&ListenUrl::tcp("127.0.0.1", port)).await?;
        let name = ServerName::try_from("localhost").unwrap();
        let connected = connector.connect(name, raw).await;
        let accepted = accept.await.unwrap();
        connected?;
        accepted
    }

    #[tokio::test]
    async fn mutual_handshake_exposes_client_identity() {
        let pki = TestPki::new();
        let server = mtls(&pki, "spiffe://example.org/registry");
        let client = mtls(&pki, "spiffe://example.org/forwarder");

        let peer = handshake(&server, &client).await.unwrap();
        assert_eq!(peer.unwrap().as_str(), "spiffe://example.org/forwarder");
    }

    #[tokio::test]
    async fn foreign_trust_domain_is_rejected() {
        let pki = TestPki::new();
        let other = TestPki::new();
        let server = mtls(&pki, "spiffe://example.org/registry");
        let client = mtls(&other, "spiffe://other.org/forwarder");

        assert!(handshake(&server, &client).await.is_err());
    }
}
