use thiserror::Error;

/// Surfaces from `AuditWAL` append/rotation paths. Per §7, `AuditError` is never shown to the
/// caller — the gateway downgrades these to a log line and moves on.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("failed to write WAL entry")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize audit event")]
    Serialize(#[from] serde_json::Error),
    #[error("WAL disk usage exceeds DROP_AFTER_MB, refusing new events")]
    BackPressure,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to mint S2S token for audit sink call")]
    Sign(#[from] svcmesh_s2s::MintError),
    #[error("audit sink request failed")]
    Transport(#[source] anyhow::Error),
}
