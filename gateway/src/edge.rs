use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse as _, Response};
use axum::routing::any;
use axum::Router;
use tower::ServiceBuilder;

use crate::audit_capture::audit_capture_middleware;
use crate::http_log::{http_log_middleware, trace5xx_middleware};
use crate::https_redirect::https_enforcement_middleware;
use crate::policy::auth_and_policy_middleware;
use crate::problem::GatewayError;
use crate::proxy::proxy_handler;
use crate::rate_limit::rate_limit_middleware;
use crate::read_only::read_only_middleware;
use crate::request_id::request_id_middleware;
use crate::route_target::route_extract_middleware;
use crate::AppState;

async fn health_live() -> &'static str {
    "ok"
}

async fn health_ready(axum::extract::State(state): axum::extract::State<AppState>) -> Response {
    let _ = state.conf.get_conf();
    (StatusCode::OK, "ready").into_response()
}

async fn not_found(request: axum::extract::Request) -> Response {
    crate::denied(&request, GatewayError::NotFound)
}

/// Builds the public edge router: the 12-step middleware chain from the outermost (audit
/// capture, so every outcome — including denials from earlier steps — is observed) inward to
/// the terminal S2S proxy handler.
pub(crate) fn build_edge_router(state: AppState) -> Router {
    Router::new()
        .route("/api/{slug}/{version}/{*rest}", any(proxy_handler))
        .route("/health/live", any(health_live))
        .route("/health/ready", any(health_ready))
        .fallback(not_found)
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn_with_state(state.clone(), audit_capture_middleware))
                .layer(middleware::from_fn_with_state(state.clone(), https_enforcement_middleware))
                .layer(middleware::from_fn(request_id_middleware))
                .layer(middleware::from_fn(http_log_middleware))
                .layer(middleware::from_fn(trace5xx_middleware))
                .layer(middleware::from_fn(route_extract_middleware))
                .layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
                .layer(middleware::from_fn_with_state(state.clone(), read_only_middleware))
                .layer(middleware::from_fn_with_state(state.clone(), auth_and_policy_middleware)),
        )
        .with_state(state)
}
