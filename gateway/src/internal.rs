use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse as _, Json, Response};
use axum::routing::{any, get};
use axum::Router;
use picky::jose::jwk::JwkSet;
use svcmesh_s2s::{JwksCache, LocalJwksSource};
use tower::ServiceBuilder;

use crate::problem::GatewayError;
use crate::request_id::RequestId;
use crate::route_target::parse_api_route;
use crate::AppState;

/// Internal control-plane state: the same [`AppState`] plus the process's own JWKS cache,
/// which the edge's [`AppState::verifier`] has no reason to hold.
#[derive(Clone)]
pub(crate) struct InternalState {
    pub app: AppState,
    pub local_jwks: Arc<JwksCache<LocalJwksSource>>,
}

async fn jwks_json(State(state): State<InternalState>) -> Result<Json<JwkSet>, Response> {
    state
        .local_jwks
        .get_jwks()
        .await
        .map(Json)
        .map_err(|source| GatewayError::Internal(source.into()).into_response("/.well-known/jwks.json", &RequestId::unknown()))
}

async fn internal_health() -> &'static str {
    "ok"
}

/// `/_internal/svcconfig/*`: a read-only window onto the mirror's current snapshot, for
/// operational inspection and for other services verifying what this gateway believes the
/// directory looks like.
async fn svcconfig_snapshot(State(state): State<InternalState>) -> Json<serde_json::Value> {
    let snapshot = state.app.mirror.snapshot();
    let records: Vec<_> = snapshot.records.values().collect();
    Json(serde_json::json!({
        "revision": snapshot.revision,
        "records": records,
    }))
}

/// `ANY /internal/call/:slug/*`: lets other in-mesh services reach one another through this
/// gateway's own S2S proxy machinery rather than dialing out directly.
async fn internal_call_proxy(State(state): State<InternalState>, request: Request) -> Result<Response, Response> {
    let path = request.uri().path().to_owned();
    let Some(rest) = path.strip_prefix("/internal/call/") else {
        return Err(GatewayError::NotFound.into_response(&path, &RequestId::unknown()));
    };
    let mut parts = rest.splitn(2, '/');
    let slug = parts.next().unwrap_or_default();
    let tail = parts.next().unwrap_or_default();

    let rebuilt_path = format!("/api/{slug}/v1/{tail}");
    let mut request = request;
    let mut uri_parts = request.uri().clone().into_parts();
    uri_parts.path_and_query = Some(
        rebuilt_path
            .parse()
            .map_err(|_| GatewayError::NotFound.into_response(&path, &RequestId::unknown()))?,
    );
    *request.uri_mut() =
        axum::http::Uri::from_parts(uri_parts).map_err(|_| GatewayError::NotFound.into_response(&path, &RequestId::unknown()))?;

    if let Some(route) = parse_api_route(request.uri().path()) {
        request.extensions_mut().insert(route);
    }

    crate::proxy::proxy_handler(State(state.app), request).await
}

/// Every route on this listener other than `/.well-known/jwks.json` and `/_internal/health`
/// requires a valid S2S bearer per §6's "mutually separate, S2S-gated" control-plane listener.
async fn require_s2s_bearer(State(state): State<InternalState>, request: Request, next: Next) -> Result<Response, Response> {
    let path = request.uri().path();
    if path == "/.well-known/jwks.json" || path == "/_internal/health" {
        return Ok(next.run(request).await);
    }

    let bearer = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(bearer) = bearer else {
        return Err((StatusCode::UNAUTHORIZED, "missing S2S bearer").into_response());
    };

    match state.app.verifier.verify(bearer).await {
        Ok(_claims) => Ok(next.run(request).await),
        Err(source) if source.is_claim_mismatch() => Err((StatusCode::FORBIDDEN, "S2S claim mismatch").into_response()),
        Err(_source) => Err((StatusCode::UNAUTHORIZED, "invalid S2S bearer").into_response()),
    }
}

pub(crate) fn build_internal_router(state: InternalState) -> Router {
    Router::new()
        .route("/.well-known/jwks.json", get(jwks_json))
        .route("/_internal/svcconfig/{*rest}", get(svcconfig_snapshot))
        .route("/internal/call/{*rest}", any(internal_call_proxy))
        .route("/_internal/health", get(internal_health))
        .layer(ServiceBuilder::new().layer(middleware::from_fn_with_state(state.clone(), require_s2s_bearer)))
        .with_state(state)
}
