use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("facilitator request failed")]
    Transport(#[source] anyhow::Error),
    #[error("facilitator returned an error response")]
    Rejected { status: u16 },
    #[error("failed to mint S2S token for facilitator call")]
    Sign(#[from] svcmesh_s2s::MintError),
}

/// `(env, slug, version)` has no [`crate::types::SvcRecord`] in the current snapshot.
#[derive(Debug, Error)]
#[error("service unknown: {env}/{slug}/v{version}")]
pub struct ServiceUnknown {
    pub env: String,
    pub slug: String,
    pub version: u32,
}

/// Route policy resolution failures, mapped to `502` by the gateway per the error taxonomy.
/// `Ambiguous` and `ResolutionFailed` are kept distinct so the edge can put a different
/// machine-readable reason on the wire for a genuine rule tie versus a resolver that
/// couldn't be reached at all.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("service unknown: {0:?}")]
    ServiceUnknown(ServiceUnknown),
    #[error("route policy is ambiguous for {method} {path}")]
    Ambiguous { method: String, path: String },
    #[error("route policy resolution failed for {method} {path}")]
    ResolutionFailed {
        method: String,
        path: String,
        #[source]
        source: FetchError,
    },
}
