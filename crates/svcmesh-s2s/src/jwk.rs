use picky::jose::jwk::{Jwa, Jwk, JwkPubKeyUse};
use picky::jose::jws::JwsAlg;
use picky::key::PublicKey;

use crate::error::JwksError;
use crate::keyhandle::KeyHandle;

/// Builds the RFC 7517 [`Jwk`] for a signing key version, attaching `{kid, use:"sig", alg}`
/// and validating the underlying key is one of our supported curves (P-256 for ES256).
pub fn jwk_from_public_key_pem(pem: &str, handle: &KeyHandle) -> Result<Jwk, JwksError> {
    let public_key = PublicKey::from_pem_str(pem).map_err(|source| JwksError::InvalidKeyMaterial { source: source.into() })?;

    let mut jwk = Jwk::from_public_key(&public_key).map_err(|source| JwksError::InvalidKeyMaterial { source: source.into() })?;

    // `JwkPublicEcKey::crv` isn't exposed directly; inspect the serialized form instead.
    let raw = serde_json::to_value(&jwk.key).map_err(|source| JwksError::InvalidKeyMaterial { source: source.into() })?;
    match (raw.get("kty").and_then(|v| v.as_str()), raw.get("crv").and_then(|v| v.as_str())) {
        (Some("EC"), Some("P-256")) => {}
        (Some("EC"), Some(other)) => {
            return Err(JwksError::InvalidKeyMaterial {
                source: anyhow::anyhow!("unsupported EC curve for ES256: {other}"),
            });
        }
        _ => {
            return Err(JwksError::InvalidKeyMaterial {
                source: anyhow::anyhow!("KeySigner must produce an EC public key for ES256"),
            });
        }
    }

    jwk.kid = Some(handle.kid());
    jwk.key_use = Some(JwkPubKeyUse::Signature);
    jwk.alg = Some(Jwa::Sig(JwsAlg::ES256));

    Ok(jwk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::test_support::LocalKeySigner;
    use crate::signer::KeySigner;

    #[test]
    fn derives_jwk_with_expected_kid_and_alg() {
        let handle = KeyHandle::new("proj", "us", "ring", "key", "1");
        let signer = LocalKeySigner::generate(handle.clone());

        let jwk = jwk_from_public_key_pem(signer.public_key_pem(), &handle).unwrap();

        assert_eq!(jwk.kid.as_deref(), Some(handle.kid().as_str()));
        assert_eq!(jwk.alg, Some(Jwa::Sig(JwsAlg::ES256)));
        assert_eq!(jwk.key_use, Some(JwkPubKeyUse::Signature));
    }
}
