//! Workload identity subsystem.
//!
//! # Data Flow
//! ```text
//! workload identity helper writes svid.pem / svid_key.pem / svid_bundle.pem
//!     → source.rs (load, wait until issued, follow rotation)
//!     → X509Source (current SVID + trust bundle)
//!     → net::tls (per-handshake certificate resolution)
//!     → token.rs (JWTs signed with the SVID key)
//! ```
//!
//! # Design Decisions
//! - One source per process; acquisition failure is fatal for startup
//! - Consumers hold `Arc<dyn X509Source>` and re-read on every use so
//!   rotated material is picked up without restart
//! - Key material stays in memory, nothing is written back to disk

pub mod source;
pub mod token;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use x509_parser::extensions::GeneralName;

pub use source::{PemFileSource, StaticSource};
pub use token::{SpiffeJwtGenerator, TokenClaims, TokenGenerator};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity directory {0} does not exist")]
    MissingDirectory(PathBuf),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificates in {0}")]
    NoCertificates(String),

    #[error("no private key in {0}")]
    NoPrivateKey(String),

    #[error("malformed certificate: {0}")]
    Certificate(String),

    #[error("invalid SPIFFE ID {0:?}: {1}")]
    InvalidSpiffeId(String, &'static str),

    #[error("certificate carries no SPIFFE ID")]
    MissingSpiffeId,

    #[error("failed to watch identity files: {0}")]
    Watch(#[from] notify::Error),

    #[error("identity watcher stopped before an SVID was issued")]
    WatcherClosed,

    #[error("failed to sign token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

impl IdentityError {
    /// Files are missing or still empty: the helper has not issued an SVID yet.
    pub fn is_pending(&self) -> bool {
        match self {
            IdentityError::Read { source, .. } => source.kind() == io::ErrorKind::NotFound,
            IdentityError::NoCertificates(_) | IdentityError::NoPrivateKey(_) => true,
            _ => false,
        }
    }
}

/// A `spiffe://trust-domain/path` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpiffeId(String);

impl SpiffeId {
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        let invalid = |reason| IdentityError::InvalidSpiffeId(s.to_string(), reason);
        let rest = s
            .strip_prefix("spiffe://")
            .ok_or_else(|| invalid("scheme must be spiffe"))?;
        let trust_domain = rest.split('/').next().unwrap_or_default();
        if trust_domain.is_empty() {
            return Err(invalid("missing trust domain"));
        }
        if trust_domain.contains([':', '@']) {
            return Err(invalid("trust domain must not carry port or user info"));
        }
        if s.contains(['?', '#']) {
            return Err(invalid("query and fragment are not allowed"));
        }
        Ok(Self(s.to_string()))
    }

    /// Extract the URI SAN from a DER certificate.
    pub fn from_certificate(der: &CertificateDer<'_>) -> Result<Self, IdentityError> {
        let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref())
            .map_err(|e| IdentityError::Certificate(e.to_string()))?;
        let san = cert
            .subject_alternative_name()
            .map_err(|e| IdentityError::Certificate(e.to_string()))?
            .ok_or(IdentityError::MissingSpiffeId)?;
        san.value
            .general_names
            .iter()
            .find_map(|name| match name {
                GeneralName::URI(uri) if uri.starts_with("spiffe://") => Some(*uri),
                _ => None,
            })
            .ok_or(IdentityError::MissingSpiffeId)
            .and_then(Self::parse)
    }

    pub fn trust_domain(&self) -> &str {
        self.0["spiffe://".len()..].split('/').next().unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An X.509 SVID: leaf-first certificate chain plus its private key.
pub struct X509Svid {
    id: SpiffeId,
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
    key_pem: Vec<u8>,
    expires_at: SystemTime,
}

impl X509Svid {
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, IdentityError> {
        let cert_chain = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| IdentityError::Certificate(e.to_string()))?;
        let leaf = cert_chain
            .first()
            .ok_or_else(|| IdentityError::NoCertificates("SVID".to_string()))?;
        let private_key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| IdentityError::Certificate(e.to_string()))?
            .ok_or_else(|| IdentityError::NoPrivateKey("SVID key".to_string()))?;

        let id = SpiffeId::from_certificate(leaf)?;
        let expires_at = not_after(leaf)?;

        Ok(Self {
            id,
            cert_chain,
            private_key,
            key_pem: key_pem.to_vec(),
            expires_at,
        })
    }

    pub fn id(&self) -> &SpiffeId {
        &self.id
    }

    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        self.private_key.clone_key()
    }

    /// PEM-encoded private key, as loaded.
    pub fn key_pem(&self) -> &[u8] {
        &self.key_pem
    }

    /// `notAfter` of the leaf certificate.
    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }
}

impl fmt::Debug for X509Svid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X509Svid")
            .field("id", &self.id)
            .field("chain_len", &self.cert_chain.len())
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

fn not_after(der: &CertificateDer<'_>) -> Result<SystemTime, IdentityError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref())
        .map_err(|e| IdentityError::Certificate(e.to_string()))?;
    let secs = cert.validity().not_after.timestamp();
    Ok(if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        SystemTime::UNIX_EPOCH
    })
}

/// Root certificates used to verify peers.
#[derive(Debug, Clone)]
pub struct TrustBundle {
    roots: Vec<CertificateDer<'static>>,
}

impl TrustBundle {
    pub fn from_pem(pem: &[u8]) -> Result<Self, IdentityError> {
        let roots = rustls_pemfile::certs(&mut &pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| IdentityError::Certificate(e.to_string()))?;
        if roots.is_empty() {
            return Err(IdentityError::NoCertificates("trust bundle".to_string()));
        }
        Ok(Self { roots })
    }

    pub fn roots(&self) -> &[CertificateDer<'static>] {
        &self.roots
    }
}

/// Provider of the process's X.509 identity.
pub trait X509Source: Send + Sync + 'static {
    /// The current SVID.
    fn svid(&self) -> Arc<X509Svid>;

    /// The current trust bundle.
    fn bundle(&self) -> Arc<TrustBundle>;
}

impl fmt::Debug for dyn X509Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X509Source({})", self.svid().id())
    }
}
