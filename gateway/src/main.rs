#[macro_use]
extern crate tracing;

mod audit_capture;
mod config;
mod edge;
mod http_log;
mod https_redirect;
mod internal;
mod policy;
mod problem;
mod proxy;
mod rate_limit;
mod read_only;
mod request_id;
mod route_target;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::extract::Request;
use axum::response::Response;
use svcmesh_audit::{AuditDispatcher, AuditWal, DispatcherConfig, WalConfig};
use svcmesh_s2s::{JwksCache, KeyHandle, KeySigner, KmsKeySigner, LocalJwksSource, RemoteJwksSource, S2SMinter, S2SVerifier};
use svcmesh_svcconfig::{FacilitatorClient, RefreshTask, RoutePolicyGate, SvcconfigMirror};
use svcmesh_task::{spawn_task, ShutdownHandle};

use crate::config::ConfHandle;
use crate::internal::InternalState;
use crate::problem::GatewayError;
use crate::rate_limit::RateLimiter;
use crate::request_id::RequestId;

/// Google Cloud KMS's REST surface, implied by the project/location/keyRing/key/version
/// resource naming `KeyHandle::resource_name` produces. There is no dedicated environment
/// variable for it: the mesh only ever talks to one KMS flavor.
const KMS_BASE_URL: &str = "https://cloudkms.googleapis.com";

/// How far to backdate `nbf` on every minted assertion, tolerating clock drift between hosts.
const NBF_SKEW: Duration = Duration::from_secs(30);

/// Shared state behind every edge middleware and the terminal proxy handler.
#[derive(Clone)]
pub(crate) struct AppState {
    pub conf: ConfHandle,
    pub minter: Arc<S2SMinter>,
    pub verifier: Arc<S2SVerifier<RemoteJwksSource>>,
    pub mirror: SvcconfigMirror,
    pub policy_gate: Arc<RoutePolicyGate<FacilitatorClient>>,
    pub rate_limiter: Arc<RateLimiter>,
    pub http_client: reqwest::Client,
    pub wal: svcmesh_audit::WalHandle,
}

/// Builds a `Problem+JSON` response carrying the request's id and path, for use at any point
/// in the pipeline that needs to short-circuit with an error.
pub(crate) fn denied(request: &Request, error: GatewayError) -> Response {
    let request_id = request.extensions().get::<RequestId>().cloned().unwrap_or_else(RequestId::unknown);
    let instance = request.uri().path().to_owned();
    error.into_response(&instance, &request_id)
}

struct GatewayLogConfig;

impl svcmesh_log::StaticLogConfig for GatewayLogConfig {
    const MAX_BYTES_PER_LOG_FILE: u64 = 50 * 1024 * 1024;
    const MAX_LOG_FILES: usize = 30;
    const LOG_FILE_PREFIX: &'static str = "gateway";
}

fn main() -> anyhow::Result<()> {
    let conf_handle = ConfHandle::init().context("unable to initialize configuration")?;
    let conf = conf_handle.get_conf();

    let _logger_guard = svcmesh_log::init::<GatewayLogConfig>(&conf.gateway.log_dir, &conf.gateway.log_filter, None)
        .context("unable to initialize logging")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the async runtime")?;

    rt.block_on(run(conf_handle))
}

async fn run(conf_handle: ConfHandle) -> anyhow::Result<()> {
    let conf = conf_handle.get_conf();

    let http_client = reqwest::Client::builder().build().context("failed to build HTTP client")?;

    anyhow::ensure!(
        conf.kms.jwt_alg == "ES256",
        "KMS_JWT_ALG must be ES256; the KMS signer supports no other algorithm"
    );

    let signer: Arc<dyn KeySigner> = Arc::new(
        KmsKeySigner::connect(
            http_client.clone(),
            KMS_BASE_URL,
            KeyHandle::new(
                conf.kms.project_id.clone(),
                conf.kms.location_id.clone(),
                conf.kms.key_ring_id.clone(),
                conf.kms.key_id.clone(),
                conf.kms.key_version.clone(),
            ),
            conf.s2s.jwks_timeout,
        )
        .await
        .context("failed to initialize KMS signer")?,
    );

    let minter = Arc::new(
        S2SMinter::new(signer.clone(), conf.gateway.service_name.clone(), conf.s2s.max_ttl, NBF_SKEW)
            .context("invalid S2S minter configuration")?,
    );

    // Shared by both listeners: the edge's `X-NV-User-Assertion` check and the internal
    // control-plane listener's `Authorization: Bearer` check both verify against this
    // gateway's own audience, so one verifier instance (and one JWKS cache behind it) serves
    // them both.
    let verifier = Arc::new(
        S2SVerifier::new(
            RemoteJwksSource::new(http_client.clone(), conf.s2s.jwks_url.clone(), conf.s2s.jwks_timeout),
            conf.s2s.jwks_cooldown,
            conf.s2s.jwt_audience.clone(),
            conf.s2s.clock_skew,
        )
        .expect_issuer(conf.s2s.jwt_issuer.clone()),
    );

    // Publishes this process's own key at `/.well-known/jwks.json`; `NV_JWKS_CACHE_TTL_MS`
    // governs how long that document is cached before the key is re-derived (a cheap local
    // operation, unlike the remote fetch `S2S_JWKS_COOLDOWN_MS` governs above).
    let local_jwks = Arc::new(JwksCache::new(LocalJwksSource::new(vec![signer]), conf.kms.jwks_cache_ttl));

    let mirror = SvcconfigMirror::new(vec![]);
    let facilitator = Arc::new(FacilitatorClient::new(
        http_client.clone(),
        conf.svcconfig.facilitator_url.clone(),
        minter.clone(),
        "svcfacilitator",
        conf.gateway.internal_proxy_timeout,
    ));
    let policy_gate = Arc::new(RoutePolicyGate::new(mirror.clone(), facilitator.clone(), conf.svcconfig.route_policy_cache_ttl));

    let dispatcher = Arc::new(AuditDispatcher::new(
        http_client.clone(),
        minter.clone(),
        DispatcherConfig {
            sink_url: conf.audit_sink_url(),
            target_slug: conf.audit.target_slug.clone(),
            service_name: conf.gateway.service_name.clone(),
            api_version: conf.audit.target_version,
            ndjson: conf.audit.ndjson,
            timeout: conf.audit.dispatch_timeout,
        },
    ));

    let wal_config = WalConfig {
        dir: conf.audit.wal_dir.clone(),
        file_max_bytes: conf.audit.file_max_mb * 1024 * 1024,
        retention_days: conf.audit.retention_days,
        ring_max_events: conf.audit.ring_max_events,
        batch_size: conf.audit.batch_size,
        drop_after_bytes: conf.audit.drop_after_mb * 1024 * 1024,
        max_retry: conf.audit.max_retry,
    };
    let (wal_handle, wal) = AuditWal::init(wal_config, dispatcher).await;

    let rate_limiter = Arc::new(RateLimiter::new(conf.gateway.rate_limit_points, conf.gateway.rate_limit_window));

    let state = AppState {
        conf: conf_handle,
        minter,
        verifier,
        mirror: mirror.clone(),
        policy_gate,
        rate_limiter,
        http_client: http_client.clone(),
        wal: wal_handle,
    };

    let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

    let wal_task = spawn_task(wal, shutdown_signal.clone());
    let refresh_task = spawn_task(
        RefreshTask {
            mirror,
            fetcher: facilitator,
            env: conf.svcconfig.env.clone(),
            interval: conf.svcconfig.refresh_interval,
        },
        shutdown_signal.clone(),
    );

    let internal_state = InternalState {
        app: state.clone(),
        local_jwks,
    };

    let edge_router = edge::build_edge_router(state);
    let internal_router = internal::build_internal_router(internal_state);

    let edge_listener = tokio::net::TcpListener::bind(&conf.gateway.edge_bind_addr)
        .await
        .with_context(|| format!("failed to bind edge listener on {}", conf.gateway.edge_bind_addr))?;
    let internal_listener = tokio::net::TcpListener::bind(&conf.gateway.internal_bind_addr)
        .await
        .with_context(|| format!("failed to bind internal listener on {}", conf.gateway.internal_bind_addr))?;

    info!(addr = %conf.gateway.edge_bind_addr, "edge listener bound");
    info!(addr = %conf.gateway.internal_bind_addr, "internal listener bound");

    let mut edge_shutdown = shutdown_signal.clone();
    let mut internal_shutdown = shutdown_signal.clone();

    let edge_task = tokio::spawn(async move {
        axum::serve(edge_listener, edge_router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move { edge_shutdown.wait().await })
            .await
    });
    let internal_task = tokio::spawn(async move {
        axum::serve(internal_listener, internal_router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move { internal_shutdown.wait().await })
            .await
    });

    tokio::select! {
        _ = build_signals_fut() => info!("shutdown signal received"),
    }

    // Tears everything down in order: signal first so `with_graceful_shutdown` lets the
    // servers drain in-flight requests, then wait for the servers themselves, then the
    // background tasks that depend on the same signal.
    shutdown_handle.signal();

    edge_task.await.context("edge server task panicked")?.context("edge server failed")?;
    internal_task.await.context("internal server task panicked")?.context("internal server failed")?;
    let _ = wal_task.join().await;
    let _ = refresh_task.join().await;
    shutdown_handle.all_closed().await;

    Ok(())
}

#[cfg(unix)]
async fn build_signals_fut() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate_signal = signal(SignalKind::terminate()).context("failed to create terminate signal stream")?;
    let mut interrupt_signal = signal(SignalKind::interrupt()).context("failed to create interrupt signal stream")?;

    tokio::select! {
        _ = terminate_signal.recv() => {}
        _ = interrupt_signal.recv() => {}
    }

    Ok(())
}

#[cfg(not(unix))]
async fn build_signals_fut() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("ctrl-c signal failed")
}
