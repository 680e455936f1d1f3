use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse as _, Response};

use crate::AppState;

/// Step 1 of the edge pipeline: `FORCE_HTTPS=true` and neither the connection itself nor
/// `X-Forwarded-Proto` says `https` → permanent redirect.
pub(crate) async fn https_enforcement_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let conf = state.conf.get_conf();

    if !conf.gateway.force_https {
        return next.run(request).await;
    }

    let forwarded_proto = request
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("https"))
        .unwrap_or(false);

    if forwarded_proto {
        return next.run(request).await;
    }

    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let target = format!("https://{host}{}", request.uri());

    let mut response = StatusCode::PERMANENT_REDIRECT.into_response();
    if let Ok(value) = HeaderValue::from_str(&target) {
        response.headers_mut().insert(axum::http::header::LOCATION, value);
    }
    response
}
