use std::time::Instant;

use axum::body::Body;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use tracing::Instrument as _;

use crate::request_id::RequestId;

/// Step 3: structured per-request logging, one span per request.
pub(crate) async fn http_log_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let request_id = request.extensions().get::<RequestId>().cloned();

    let span = tracing::info_span!("request", %method, %path, request_id = request_id.as_ref().map(|r| r.0.as_str()));

    async move {
        let start = Instant::now();
        debug!("received request");
        let response = next.run(request).await;
        let status = response.status();
        info!(duration = ?start.elapsed(), %status, "request completed");
        response
    }
    .instrument(span)
    .await
}

/// Step 4: observe-only. Records the first call site that sets a 5xx status so the error
/// handling design's "first assignment recorded by trace5xx" invariant holds; never mutates
/// the response.
pub(crate) async fn trace5xx_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();

    let response = next.run(request).await;

    if response.status().is_server_error() {
        tracing::warn!(%method, %path, status = response.status().as_u16(), "first 5xx observed for this request");
    }

    response
}
