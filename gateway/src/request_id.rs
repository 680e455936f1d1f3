use axum::body::Body;
use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

/// Step 2 of the edge pipeline: adopt an inbound correlation header or mint a fresh UUIDv4,
/// stash it as a request extension for downstream steps, and echo it on the response.
#[derive(Debug, Clone)]
pub(crate) struct RequestId(pub String);

impl RequestId {
    /// Fallback for call sites with no request extension to pull a real id from.
    pub(crate) fn unknown() -> Self {
        Self("unknown".to_owned())
    }
}

const INBOUND_HEADERS: &[&str] = &["x-request-id", "x-correlation-id", "x-amzn-trace-id"];

fn adopt_or_mint(request: &Request<Body>) -> String {
    for header in INBOUND_HEADERS {
        if let Some(value) = request.headers().get(*header).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return value.to_owned();
            }
        }
    }
    Uuid::new_v4().to_string()
}

pub(crate) async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = RequestId(adopt_or_mint(&request));
    request.extensions_mut().insert(request_id.clone());

    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&request_id.0) {
        response.headers_mut().insert("x-request-id", value);
    }

    response
}
