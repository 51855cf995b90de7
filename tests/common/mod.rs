//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use registry_k8s::identity::source::{BUNDLE_FILE, SVID_FILE, SVID_KEY_FILE};
use registry_k8s::identity::{StaticSource, TrustBundle, X509Source, X509Svid};
use registry_k8s::net::ListenUrl;
use registry_k8s::RegistryConfig;

/// A throwaway certificate authority.
pub struct Pki {
    pub ca_pem: String,
    ca_cert: Certificate,
    ca_key: KeyPair,
}

pub struct Issued {
    pub cert_pem: String,
    pub key_pem: String,
}

impl Pki {
    pub fn new() -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, "integration-ca");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = params.self_signed(&ca_key).unwrap();
        Self {
            ca_pem: ca_cert.pem(),
            ca_cert,
            ca_key,
        }
    }

    pub fn issue(&self, spiffe_id: &str) -> Issued {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, "svid");
        params.subject_alt_names = vec![SanType::URI(spiffe_id.try_into().unwrap())];
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();
        Issued {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        }
    }

    /// In-memory identity for `spiffe_id`.
    pub fn source(&self, spiffe_id: &str) -> Arc<dyn X509Source> {
        let issued = self.issue(spiffe_id);
        let svid = X509Svid::from_pem(issued.cert_pem.as_bytes(), issued.key_pem.as_bytes()).unwrap();
        let bundle = TrustBundle::from_pem(self.ca_pem.as_bytes()).unwrap();
        Arc::new(StaticSource::new(svid, bundle))
    }

    /// Write an SVID for `spiffe_id` the way the identity helper does.
    pub fn write_svid(&self, dir: &Path, spiffe_id: &str) {
        let issued = self.issue(spiffe_id);
        std::fs::write(dir.join(BUNDLE_FILE), &self.ca_pem).unwrap();
        std::fs::write(dir.join(SVID_KEY_FILE), &issued.key_pem).unwrap();
        std::fs::write(dir.join(SVID_FILE), &issued.cert_pem).unwrap();
    }
}

/// A loopback TCP URL whose port was free a moment ago.
pub fn free_tcp_url() -> ListenUrl {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    ListenUrl::tcp("127.0.0.1", probe.local_addr().unwrap().port())
}

/// Registry config serving on `listen_on`, with no policy files.
pub fn config_for(listen_on: Vec<ListenUrl>) -> RegistryConfig {
    RegistryConfig {
        listen_on,
        registry_server_policies: vec![],
        registry_client_policies: vec![],
        ..Default::default()
    }
}
