use std::time::Duration;

use picky::jose::jwk::JwkSet;
use picky::jose::jws::{JwsError, RawJws};
use picky::jose::jwt::{JwtDate, JwtError, JwtSig, JwtValidator};
use time::OffsetDateTime;

use crate::error::{JwksError, VerifyError};
use crate::jwks::{JwksCache, JwksSource};
use crate::minter::AssertionClaims;

/// Verifies inbound bearer tokens against a remote JWKS, with issuer/audience/clock-skew
/// checks the underlying `JwtValidator` doesn't perform on its own. Never consults a static
/// secret; replay prevention is explicitly out of scope (short TTLs only).
pub struct S2SVerifier<S> {
    jwks: JwksCache<S>,
    expected_issuer: Option<String>,
    expected_audience: String,
    clock_skew: Duration,
}

impl<S: JwksSource> S2SVerifier<S> {
    pub fn new(jwks_source: S, jwks_ttl: Duration, expected_audience: impl Into<String>, clock_skew: Duration) -> Self {
        Self {
            jwks: JwksCache::new(jwks_source, jwks_ttl),
            expected_issuer: None,
            expected_audience: expected_audience.into(),
            clock_skew,
        }
    }

    /// Restricts verification to tokens minted by `issuer`. Omitted by default: a gateway that
    /// accepts calls from many callers checks `aud` only and leaves `iss` pinning to policy.
    pub fn expect_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.expected_issuer = Some(issuer.into());
        self
    }

    pub async fn verify(&self, token: &str) -> Result<AssertionClaims, VerifyError> {
        let raw = RawJws::decode(token).map_err(|source| VerifyError::Malformed { source: source.into() })?;

        let kid = raw.header.kid.clone().ok_or_else(|| VerifyError::Malformed {
            source: anyhow::anyhow!("token is missing a kid"),
        })?;

        let jwks = self
            .jwks
            .get_jwks()
            .await
            .map_err(|source| VerifyError::JwksUnavailable { source })?;
        let public_key = find_key(&jwks, &kid)?;

        let jwt: JwtSig = raw
            .verify(&public_key)
            .map(JwtSig::from)
            .map_err(classify_jws_error)?;

        let skew_secs: u16 = self.clock_skew.as_secs().try_into().unwrap_or(u16::MAX);
        let now = JwtDate::new_with_leeway(OffsetDateTime::now_utc().unix_timestamp(), skew_secs);
        let validator = JwtValidator::strict(now);

        let claims = jwt
            .validate::<AssertionClaims>(&validator)
            .map_err(classify_jwt_error)?
            .state
            .claims;

        if let Some(expected_issuer) = &self.expected_issuer {
            if &claims.iss != expected_issuer {
                return Err(VerifyError::IssuerMismatch {
                    expected: expected_issuer.clone(),
                    actual: claims.iss,
                });
            }
        }

        if claims.aud != self.expected_audience {
            return Err(VerifyError::AudienceMismatch {
                expected: self.expected_audience.clone(),
                actual: claims.aud,
            });
        }

        Ok(claims)
    }

    pub async fn force_jwks_refresh(&self) {
        self.jwks.expire_now().await;
    }
}

fn find_key(jwks: &JwkSet, kid: &str) -> Result<picky::key::PublicKey, VerifyError> {
    let jwk = jwks
        .keys
        .iter()
        .find(|jwk| jwk.kid.as_deref() == Some(kid))
        .ok_or_else(|| VerifyError::UnknownKid { kid: kid.to_owned() })?;

    jwk.to_public_key().map_err(|source| VerifyError::JwksUnavailable {
        source: JwksError::InvalidKeyMaterial { source: source.into() },
    })
}

fn classify_jws_error(source: JwsError) -> VerifyError {
    match source {
        JwsError::Signature { .. } => VerifyError::BadSignature,
        other => VerifyError::Malformed { source: other.into() },
    }
}

fn classify_jwt_error(source: JwtError) -> VerifyError {
    match source {
        JwtError::Expired { .. } | JwtError::NotYetValid { .. } => VerifyError::Expired,
        JwtError::Jws { source } => classify_jws_error(source),
        other => VerifyError::Malformed { source: other.into() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwks::LocalJwksSource;
    use crate::keyhandle::KeyHandle;
    use crate::minter::S2SMinter;
    use crate::signer::test_support::LocalKeySigner;
    use serde_json::Map;
    use std::sync::Arc;

    fn minter_and_verifier() -> (S2SMinter, S2SVerifier<LocalJwksSource>) {
        let signer: Arc<dyn crate::signer::KeySigner> = Arc::new(LocalKeySigner::generate(KeyHandle::new("p", "l", "r", "k", "1")));
        let minter = S2SMinter::new(signer.clone(), "gateway", Duration::from_secs(60), Duration::from_secs(30)).unwrap();
        let verifier = S2SVerifier::new(LocalJwksSource::new(vec![signer]), Duration::from_secs(60), "target", Duration::from_secs(30));
        (minter, verifier)
    }

    #[tokio::test]
    async fn sign_then_verify_succeeds_within_validity_window() {
        let (minter, verifier) = minter_and_verifier();

        let token = minter.mint("target", "gateway", Duration::from_secs(30), Map::new()).await.unwrap();

        let claims = verifier.verify(&token).await.unwrap();
        assert_eq!(claims.aud, "target");
        assert_eq!(claims.sub, "gateway");
    }

    #[tokio::test]
    async fn verify_fails_on_audience_mismatch() {
        let (minter, verifier) = minter_and_verifier();

        let token = minter.mint("someone-else", "gateway", Duration::from_secs(30), Map::new()).await.unwrap();

        let err = verifier.verify(&token).await.unwrap_err();
        assert!(matches!(err, VerifyError::AudienceMismatch { .. }));
        assert!(err.is_claim_mismatch());
    }

    #[tokio::test]
    async fn verify_fails_on_unknown_kid() {
        let (minter, _) = minter_and_verifier();
        let other_signer: Arc<dyn crate::signer::KeySigner> = Arc::new(LocalKeySigner::generate(KeyHandle::new("p", "l", "r", "k", "2")));
        let stale_verifier = S2SVerifier::new(LocalJwksSource::new(vec![other_signer]), Duration::from_secs(60), "target", Duration::from_secs(30));

        let token = minter.mint("target", "gateway", Duration::from_secs(30), Map::new()).await.unwrap();

        let err = stale_verifier.verify(&token).await.unwrap_err();
        assert!(matches!(err, VerifyError::UnknownKid { .. }));
    }
}
