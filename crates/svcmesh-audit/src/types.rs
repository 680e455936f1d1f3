use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Why a response finished, per §4.10's derivation rules. `ShutdownReplay` is stamped on
/// events that survive a crash and are re-sent by the WAL's startup replay rather than by
/// live capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinalizeReason {
    Finish,
    Timeout,
    ClientAbort,
    ShutdownReplay,
}

/// One audit record, NDJSON-serialized one-per-line into the current WAL file. Required
/// fields are always present; the optional ones are omitted from the wire form rather than
/// serialized as `null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub event_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub duration_ms: u64,
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub slug: String,
    pub status: u16,
    pub billable_units: u64,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "time::serde::rfc3339::option")]
    pub ts_start: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_reliable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize_reason: Option<FinalizeReason>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}

/// `{file, byteOffset}`, persisted to `audit.offset`. Advances only on confirmed drain or a
/// poison-skip decision — never just because an event was appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalCursor {
    pub file: String,
    pub byte_offset: u64,
}
