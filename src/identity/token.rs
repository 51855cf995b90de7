//! JWT generation from the X.509 SVID.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::identity::{IdentityError, SpiffeId, X509Source};

/// Produces bearer tokens for outgoing calls.
pub trait TokenGenerator: Send + Sync + 'static {
    /// A signed token and its expiry. `audience` is the peer the token is
    /// meant for, when known.
    fn generate(&self, audience: Option<&SpiffeId>) -> Result<(String, SystemTime), IdentityError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

/// Signs tokens with the current SVID key.
///
/// Expiry is the earlier of `now + max_lifetime` and the SVID's own expiry.
pub struct SpiffeJwtGenerator {
    source: Arc<dyn X509Source>,
    max_lifetime: Duration,
}

impl SpiffeJwtGenerator {
    pub fn new(source: Arc<dyn X509Source>, max_lifetime: Duration) -> Self {
        Self {
            source,
            max_lifetime,
        }
    }
}

impl TokenGenerator for SpiffeJwtGenerator {
    fn generate(&self, audience: Option<&SpiffeId>) -> Result<(String, SystemTime), IdentityError> {
        let svid = self.source.svid();

        let expires_at = SystemTime::now()
            .checked_add(self.max_lifetime)
            .map_or(svid.expires_at(), |limit| limit.min(svid.expires_at()));
        let claims = TokenClaims {
            sub: svid.id().to_string(),
            exp: expires_at
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            aud: audience.map(ToString::to_string),
        };

        let (algorithm, key) = match EncodingKey::from_ec_pem(svid.key_pem()) {
            Ok(key) => (Algorithm::ES256, key),
            Err(_) => (Algorithm::RS256, EncodingKey::from_rsa_pem(svid.key_pem())?),
        };
        let token = encode(&Header::new(algorithm), &claims, &key)?;
        Ok((token, expires_at))
    }
}
