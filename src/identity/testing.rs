//! Throwaway PKI for unit tests.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};

use crate::identity::{StaticSource, TrustBundle, X509Svid};

pub struct TestPki {
    pub ca_pem: String,
    ca_cert: Certificate,
    ca_key: KeyPair,
}

pub struct IssuedSvid {
    pub cert_pem: String,
    pub key_pem: String,
    pub public_key_pem: String,
}

impl TestPki {
    pub fn new() -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, "test-ca");
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

    pub fn issue(&self, spiffe_id: &str) -> IssuedSvid {
        self.issue_with(spiffe_id, |_| {})
    }

    pub fn issue_until(&self, spiffe_id: &str, (y, m, d): (i32, u8, u8)) -> IssuedSvid {
        self.issue_with(spiffe_id, |params| {
            params.not_after = rcgen::date_time_ymd(y, m, d);
        })
    }

    fn issue_with(&self, spiffe_id: &str, adjust: impl FnOnce(&mut CertificateParams)) -> IssuedSvid {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, "svid");
        params.subject_alt_names = vec![SanType::URI(spiffe_id.try_into().unwrap())];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        adjust(&mut params);

        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();
        IssuedSvid {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            public_key_pem: key.public_key_pem(),
        }
    }

    pub fn bundle(&self) -> TrustBundle {
        TrustBundle::from_pem(self.ca_pem.as_bytes()).unwrap()
    }
}

impl IssuedSvid {
    pub fn svid(&self) -> X509Svid {
        X509Svid::from_pem(self.cert_pem.as_bytes(), self.key_pem.as_bytes()).unwrap()
    }

    pub fn source(&self, pki: &TestPki) -> StaticSource {
        StaticSource::new(self.svid(), pki.bundle())
    }
}
