use thiserror::Error;

/// Errors surfaced by [`crate::signer::KeySigner`] implementations.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("KMS is unavailable")]
    KmsUnavailable {
        #[source]
        source: anyhow::Error,
    },

    #[error("KMS denied the signing request")]
    KmsDenied {
        #[source]
        source: anyhow::Error,
    },
}

/// Errors surfaced by [`crate::jwks::JwksProvider`].
#[derive(Debug, Error)]
pub enum JwksError {
    #[error("JWKS is unavailable")]
    Unavailable {
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid public key material from KMS")]
    InvalidKeyMaterial {
        #[source]
        source: anyhow::Error,
    },
}

/// Errors surfaced when minting an outbound S2S assertion.
#[derive(Debug, Error)]
pub enum MintError {
    #[error("invalid assertion claims: {reason}")]
    InvalidClaims { reason: &'static str },

    #[error(transparent)]
    Signer(#[from] SignerError),

    #[error("failed to encode JWT")]
    Encode {
        #[source]
        source: anyhow::Error,
    },
}

/// Errors surfaced when verifying an inbound bearer token. Each variant names the HTTP
/// status the edge should translate it to (see §7 of the design).
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("token is malformed")]
    Malformed {
        #[source]
        source: anyhow::Error,
    },

    #[error("signature verification failed")]
    BadSignature,

    #[error("token expired or not yet valid")]
    Expired,

    #[error("unknown key id: {kid}")]
    UnknownKid { kid: String },

    #[error("issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch { expected: String, actual: String },

    #[error("audience mismatch: expected {expected}, got {actual}")]
    AudienceMismatch { expected: String, actual: String },

    #[error("JWKS unavailable")]
    JwksUnavailable {
        #[source]
        source: JwksError,
    },
}

impl VerifyError {
    /// `true` for claim-mismatch variants (403), `false` for everything else (401/502).
    pub fn is_claim_mismatch(&self) -> bool {
        matches!(self, Self::IssuerMismatch { .. } | Self::AudienceMismatch { .. })
    }
}
