use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use camino::Utf8PathBuf;

/// Required environment, read once at boot. No field has a silent default: a missing variable
/// fails [`Conf::from_env`] rather than falling back to a guessed value.
#[derive(Debug, Clone)]
pub(crate) struct Conf {
    pub s2s: S2SConf,
    pub kms: KmsConf,
    pub gateway: GatewayConf,
    pub audit: AuditConf,
    pub svcconfig: SvcconfigConf,
}

#[derive(Debug, Clone)]
pub(crate) struct S2SConf {
    pub jwks_url: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub clock_skew: Duration,
    pub jwks_cooldown: Duration,
    pub jwks_timeout: Duration,
    pub max_ttl: Duration,
}

#[derive(Debug, Clone)]
pub(crate) struct KmsConf {
    pub project_id: String,
    pub location_id: String,
    pub key_ring_id: String,
    pub key_id: String,
    pub key_version: String,
    pub jwt_alg: String,
    pub jwks_cache_ttl: Duration,
}

#[derive(Debug, Clone)]
pub(crate) struct GatewayConf {
    pub force_https: bool,
    pub read_only_mode: bool,
    pub read_only_exempt_prefixes: Vec<String>,
    pub rate_limit_points: u32,
    pub rate_limit_window: Duration,
    pub internal_proxy_timeout: Duration,
    pub auth_public_prefixes: Vec<String>,
    pub public_get_require_auth_prefixes: Vec<String>,
    pub edge_bind_addr: String,
    pub internal_bind_addr: String,
    pub service_name: String,
    pub log_dir: Utf8PathBuf,
    pub log_filter: String,
}

#[derive(Debug, Clone)]
pub(crate) struct AuditConf {
    pub wal_dir: Utf8PathBuf,
    pub file_max_mb: u64,
    pub retention_days: u32,
    pub ring_max_events: usize,
    pub batch_size: usize,
    pub drop_after_mb: u64,
    pub dispatch_timeout: Duration,
    pub max_retry: Duration,
    pub ndjson: bool,
    pub target_slug: String,
    pub target_version: u32,
    pub target_path: String,
}

#[derive(Debug, Clone)]
pub(crate) struct SvcconfigConf {
    pub facilitator_url: String,
    pub env: String,
    pub refresh_interval: Duration,
    pub route_policy_cache_ttl: Duration,
}

fn required(name: &str) -> anyhow::Result<String> {
    env::var(name).with_context(|| format!("missing required environment variable {name}"))
}

fn required_u64(name: &str) -> anyhow::Result<u64> {
    let raw = required(name)?;
    raw.parse::<u64>().with_context(|| format!("{name} must be a non-negative integer, got {raw:?}"))
}

fn required_u32(name: &str) -> anyhow::Result<u32> {
    let raw = required(name)?;
    raw.parse::<u32>().with_context(|| format!("{name} must be a non-negative integer, got {raw:?}"))
}

fn required_bool(name: &str) -> anyhow::Result<bool> {
    let raw = required(name)?;
    match raw.as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => bail!("{name} must be a boolean (true/false/1/0), got {other:?}"),
    }
}

fn required_ms(name: &str) -> anyhow::Result<Duration> {
    required_u64(name).map(Duration::from_millis)
}

fn required_secs(name: &str) -> anyhow::Result<Duration> {
    required_u64(name).map(Duration::from_secs)
}

fn required_prefix_list(name: &str) -> anyhow::Result<Vec<String>> {
    let raw = required(name)?;
    Ok(raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect())
}

impl Conf {
    pub(crate) fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            s2s: S2SConf {
                jwks_url: required("S2S_JWKS_URL")?,
                jwt_issuer: required("S2S_JWT_ISSUER")?,
                jwt_audience: required("S2S_JWT_AUDIENCE")?,
                clock_skew: required_secs("S2S_CLOCK_SKEW_SEC")?,
                jwks_cooldown: required_ms("S2S_JWKS_COOLDOWN_MS")?,
                jwks_timeout: required_ms("S2S_JWKS_TIMEOUT_MS")?,
                max_ttl: required_secs("S2S_MAX_TTL_SEC")?,
            },
            kms: KmsConf {
                project_id: required("KMS_PROJECT_ID")?,
                location_id: required("KMS_LOCATION_ID")?,
                key_ring_id: required("KMS_KEY_RING_ID")?,
                key_id: required("KMS_KEY_ID")?,
                key_version: required("KMS_KEY_VERSION")?,
                jwt_alg: required("KMS_JWT_ALG")?,
                jwks_cache_ttl: required_ms("NV_JWKS_CACHE_TTL_MS")?,
            },
            gateway: GatewayConf {
                force_https: required_bool("FORCE_HTTPS")?,
                read_only_mode: required_bool("READ_ONLY_MODE")?,
                read_only_exempt_prefixes: required_prefix_list("READ_ONLY_EXEMPT_PREFIXES")?,
                rate_limit_points: required_u32("RATE_LIMIT_POINTS")?,
                rate_limit_window: required_ms("RATE_LIMIT_WINDOW_MS")?,
                internal_proxy_timeout: required_ms("INTERNAL_PROXY_TIMEOUT_MS")?,
                auth_public_prefixes: required_prefix_list("AUTH_PUBLIC_PREFIXES")?,
                public_get_require_auth_prefixes: required_prefix_list("PUBLIC_GET_REQUIRE_AUTH_PREFIXES")?,
                edge_bind_addr: required("GATEWAY_EDGE_BIND_ADDR")?,
                internal_bind_addr: required("GATEWAY_INTERNAL_BIND_ADDR")?,
                service_name: required("GATEWAY_SERVICE_NAME")?,
                log_dir: Utf8PathBuf::from(required("GATEWAY_LOG_DIR")?),
                log_filter: required("GATEWAY_LOG_FILTER")?,
            },
            audit: AuditConf {
                wal_dir: Utf8PathBuf::from(required("WAL_DIR")?),
                file_max_mb: required_u64("WAL_FILE_MAX_MB")?,
                retention_days: required_u32("WAL_RETENTION_DAYS")?,
                ring_max_events: required_u64("WAL_RING_MAX_EVENTS")?.try_into().context("WAL_RING_MAX_EVENTS too large")?,
                batch_size: required_u64("WAL_BATCH_SIZE")?.try_into().context("WAL_BATCH_SIZE too large")?,
                drop_after_mb: required_u64("WAL_DROP_AFTER_MB")?,
                dispatch_timeout: required_ms("WAL_DISPATCH_TIMEOUT_MS")?,
                max_retry: required_ms("WAL_MAX_RETRY_MS")?,
                ndjson: required_bool("AUDIT_NDJSON")?,
                target_slug: required("AUDIT_TARGET_SLUG")?,
                target_version: required_u32("AUDIT_TARGET_VERSION")?,
                target_path: required("AUDIT_TARGET_PATH")?,
            },
            svcconfig: SvcconfigConf {
                facilitator_url: required("SVCCONFIG_FACILITATOR_URL")?,
                env: required("SVCCONFIG_ENV")?,
                refresh_interval: required_ms("SVCCONFIG_REFRESH_INTERVAL_MS")?,
                route_policy_cache_ttl: required_ms("SVCCONFIG_ROUTE_POLICY_CACHE_TTL_MS")?,
            },
        })
    }

    pub(crate) fn audit_sink_url(&self) -> String {
        format!(
            "{}/api/{}/v{}{}",
            self.audit.target_path.trim_end_matches('/'),
            self.audit.target_slug,
            self.audit.target_version,
            "/events"
        )
    }
}

/// Configuration handle, source of truth for the current configuration state. `READ_ONLY_MODE`
/// and the other gateway flags are re-read on every request through this handle rather than
/// captured once at startup, so an operator flipping the flag out-of-band (e.g. via a
/// supervisor restarting the process with a new environment) never requires a code change to
/// take effect on the next process generation.
#[derive(Clone)]
pub(crate) struct ConfHandle {
    inner: Arc<parking_lot::RwLock<Arc<Conf>>>,
}

impl ConfHandle {
    pub(crate) fn init() -> anyhow::Result<Self> {
        let conf = Conf::from_env().context("invalid configuration")?;
        Ok(Self {
            inner: Arc::new(parking_lot::RwLock::new(Arc::new(conf))),
        })
    }

    /// Returns current configuration state (do not hold it forever as it may become outdated).
    pub(crate) fn get_conf(&self) -> Arc<Conf> {
        self.inner.read().clone()
    }
}
