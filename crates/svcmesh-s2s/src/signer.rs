use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest as _, Sha256};

use crate::error::SignerError;
use crate::keyhandle::KeyHandle;

/// Produces raw signatures for a canonical JWT signing input using a bound KMS key version,
/// and exposes the SPKI PEM of its public key. ES256 only; there is no software fallback.
#[async_trait]
pub trait KeySigner: Send + Sync {
    /// Signs `signing_input` (the `base64url(header).base64url(payload)` JWS signing input),
    /// returning an ASN.1 DER-encoded ECDSA signature. Signatures are opaque to the caller.
    async fn sign(&self, signing_input: &[u8]) -> Result<Vec<u8>, SignerError>;

    /// SPKI PEM of the public key for the configured key version.
    fn public_key_pem(&self) -> &str;

    fn key_handle(&self) -> &KeyHandle;
}

/// Signs over a REST KMS endpoint. Holds no private key material; every signature round-trips
/// through the network.
pub struct KmsKeySigner {
    client: reqwest::Client,
    kms_base: String,
    handle: KeyHandle,
    public_key_pem: String,
    sign_timeout: Duration,
}

#[derive(Deserialize)]
struct GetPublicKeyResponse {
    pem: String,
}

#[derive(serde::Serialize)]
struct AsymmetricSignRequest<'a> {
    digest: Digest<'a>,
}

#[derive(serde::Serialize)]
struct Digest<'a> {
    sha256: &'a str,
}

#[derive(Deserialize)]
struct AsymmetricSignResponse {
    signature: String,
}

impl KmsKeySigner {
    /// Resolves the public key for `handle` once (boot-time), then holds the client ready to
    /// sign. `kms_base` is the base URL of the KMS REST surface, e.g. `https://kms.internal`.
    pub async fn connect(
        client: reqwest::Client,
        kms_base: impl Into<String>,
        handle: KeyHandle,
        sign_timeout: Duration,
    ) -> Result<Self, SignerError> {
        let kms_base = kms_base.into();

        let url = format!("{kms_base}/v1/{}:getPublicKey", handle.resource_name());

        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|source| SignerError::KmsUnavailable { source: source.into() })?;

        let response = map_kms_status(response).await?;

        let body: GetPublicKeyResponse = response
            .json()
            .await
            .map_err(|source| SignerError::KmsUnavailable { source: source.into() })?;

        Ok(Self {
            client,
            kms_base,
            handle,
            public_key_pem: body.pem,
            sign_timeout,
        })
    }
}

async fn map_kms_status(response: reqwest::Response) -> Result<reqwest::Response, SignerError> {
    let status = response.status();

    if status.is_success() {
        Ok(response)
    } else if status.as_u16() == 401 || status.as_u16() == 403 {
        Err(SignerError::KmsDenied {
            source: anyhow::anyhow!("KMS returned {status}"),
        })
    } else {
        Err(SignerError::KmsUnavailable {
            source: anyhow::anyhow!("KMS returned {status}"),
        })
    }
}

#[async_trait]
impl KeySigner for KmsKeySigner {
    async fn sign(&self, signing_input: &[u8]) -> Result<Vec<u8>, SignerError> {
        use base64::Engine as _;

        let digest = Sha256::digest(signing_input);
        let digest_b64 = base64::engine::general_purpose::STANDARD.encode(digest);

        let url = format!("{}/v1/{}:asymmetricSign", self.kms_base, self.handle.resource_name());

        let response = self
            .client
            .post(&url)
            .timeout(self.sign_timeout)
            .json(&AsymmetricSignRequest { digest: Digest { sha256: &digest_b64 } })
            .send()
            .await
            .map_err(|source| {
                if source.is_timeout() {
                    SignerError::KmsUnavailable { source: source.into() }
                } else {
                    SignerError::KmsUnavailable { source: source.into() }
                }
            })?;

        let response = map_kms_status(response).await?;

        let body: AsymmetricSignResponse = response
            .json()
            .await
            .map_err(|source| SignerError::KmsUnavailable { source: source.into() })?;

        base64::engine::general_purpose::STANDARD
            .decode(body.signature)
            .map_err(|source| SignerError::KmsUnavailable { source: source.into() })
    }

    fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    fn key_handle(&self) -> &KeyHandle {
        &self.handle
    }
}

/// In-process signer backed by a locally generated P-256 key. Never compiled into the
/// production binary's call path outside tests: it exists so unit/integration tests can mint
/// and verify S2S tokens without reaching a real KMS.
#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use picky::hash::HashAlgorithm;
    use picky::key::{EcCurve, PrivateKey};
    use picky::signature::SignatureAlgorithm;

    use super::*;

    pub struct LocalKeySigner {
        private_key: PrivateKey,
        public_key_pem: String,
        handle: KeyHandle,
    }

    impl LocalKeySigner {
        pub fn generate(handle: KeyHandle) -> Self {
            let private_key = PrivateKey::generate_ec(EcCurve::NistP256).expect("P-256 key generation");
            let public_key_pem = private_key
                .to_public_key()
                .expect("derive public key")
                .to_pem_str()
                .expect("PEM-encode public key");

            Self {
                private_key,
                public_key_pem,
                handle,
            }
        }
    }

    #[async_trait]
    impl KeySigner for LocalKeySigner {
        async fn sign(&self, signing_input: &[u8]) -> Result<Vec<u8>, SignerError> {
            SignatureAlgorithm::Ecdsa(HashAlgorithm::SHA2_256)
                .sign(signing_input, &self.private_key)
                .map_err(|source| SignerError::KmsUnavailable { source: source.into() })
        }

        fn public_key_pem(&self) -> &str {
            &self.public_key_pem
        }

        fn key_handle(&self) -> &KeyHandle {
            &self.handle
        }
    }
}
