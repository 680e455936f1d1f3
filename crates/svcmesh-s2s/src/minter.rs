use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::ecdsa::{der_to_fixed_width, P256_COMPONENT_SIZE};
use crate::error::MintError;
use crate::signer::KeySigner;

/// `S2S_MAX_TTL_SEC` must not exceed this.
pub const MAX_TTL_SECS: i64 = 900;

/// `{ iss, aud, sub, iat, nbf, exp, jti, kid, extra? }`, RFC 7519 claims plus the service-mesh
/// custom ones. `nbf <= iat <= exp` and `exp - iat <= 900s` are enforced by the minter, never
/// by the struct itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: Uuid,
    pub kid: String,
    #[serde(flatten, skip_serializing_if = "Map::is_empty", default)]
    pub extra: Map<String, serde_json::Value>,
}

/// Mints short-lived ES256 bearer assertions for outbound S2S calls.
pub struct S2SMinter {
    signer: Arc<dyn KeySigner>,
    issuer: String,
    max_ttl: Duration,
    nbf_skew: Duration,
}

impl S2SMinter {
    /// `max_ttl` must be `<= 900s`; `nbf_skew` is expected in the 30-60s range per the design,
    /// but only the upper bound matters for correctness so it isn't hard-enforced here.
    pub fn new(signer: Arc<dyn KeySigner>, issuer: impl Into<String>, max_ttl: Duration, nbf_skew: Duration) -> Result<Self, MintError> {
        if max_ttl.as_secs() > MAX_TTL_SECS as u64 {
            return Err(MintError::InvalidClaims {
                reason: "max_ttl exceeds S2S_MAX_TTL_SEC ceiling of 900s",
            });
        }

        Ok(Self {
            signer,
            issuer: issuer.into(),
            max_ttl,
            nbf_skew,
        })
    }

    /// Mints an assertion with `aud=target_slug`, `sub=sub`, valid for `ttl` (capped at the
    /// configured `max_ttl`), backdated by `nbf_skew` to tolerate clock drift between hosts.
    pub async fn mint(&self, target_slug: &str, sub: &str, ttl: Duration, extra: Map<String, serde_json::Value>) -> Result<String, MintError> {
        if target_slug.is_empty() {
            return Err(MintError::InvalidClaims { reason: "aud must be non-empty" });
        }

        let ttl = ttl.min(self.max_ttl);
        let now = OffsetDateTime::now_utc();
        let nbf = now - self.nbf_skew;
        let exp = now + ttl;

        let claims = AssertionClaims {
            iss: self.issuer.clone(),
            aud: target_slug.to_owned(),
            sub: sub.to_owned(),
            iat: now.unix_timestamp(),
            nbf: nbf.unix_timestamp(),
            exp: exp.unix_timestamp(),
            jti: Uuid::new_v4(),
            kid: self.signer.key_handle().kid(),
            extra,
        };

        self.encode(&claims).await
    }

    /// Builds and signs the JWS compact representation by hand: `KeySigner::sign` is async
    /// (the key may live behind a network call to KMS), so picky's own synchronous
    /// `Jws::encode(&PrivateKey)` can't be used here directly.
    async fn encode(&self, claims: &AssertionClaims) -> Result<String, MintError> {
        let header = serde_json::json!({ "alg": "ES256", "kid": claims.kid, "typ": "JWT" });

        let header_b64 = base64_url(&serde_json::to_vec(&header).map_err(|source| MintError::Encode { source: source.into() })?);
        let payload_b64 = base64_url(&serde_json::to_vec(claims).map_err(|source| MintError::Encode { source: source.into() })?);
        let signing_input = format!("{header_b64}.{payload_b64}");

        let der_signature = self.signer.sign(signing_input.as_bytes()).await?;
        let fixed_signature =
            der_to_fixed_width(&der_signature, P256_COMPONENT_SIZE).map_err(|source| MintError::Encode { source })?;

        Ok(format!("{signing_input}.{}", base64_url(&fixed_signature)))
    }
}

fn base64_url(bytes: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyhandle::KeyHandle;
    use crate::signer::test_support::LocalKeySigner;

    #[tokio::test]
    async fn mint_rejects_ttl_over_the_s2s_ceiling() {
        let signer = Arc::new(LocalKeySigner::generate(KeyHandle::new("p", "l", "r", "k", "1")));
        let result = S2SMinter::new(signer, "gateway", Duration::from_secs(901), Duration::from_secs(30));
        assert!(matches!(result, Err(MintError::InvalidClaims { .. })));
    }

    #[tokio::test]
    async fn mint_produces_three_dot_separated_jws() {
        let signer = Arc::new(LocalKeySigner::generate(KeyHandle::new("p", "l", "r", "k", "1")));
        let minter = S2SMinter::new(signer, "gateway", Duration::from_secs(60), Duration::from_secs(30)).unwrap();

        let token = minter.mint("target", "gateway", Duration::from_secs(30), Map::new()).await.unwrap();

        assert_eq!(token.split('.').count(), 3);
    }
}
