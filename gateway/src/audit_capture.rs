use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use bytes::Bytes;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use http_body::{Body as HttpBody, Frame};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::request_id::RequestId;
use crate::route_target::RouteTarget;
use crate::AppState;
use svcmesh_audit::{AuditEvent, FinalizeReason, WalHandle};

const FAVICON: &str = "/favicon.ico";

fn is_eligible(path: &str) -> bool {
    if matches!(path, "/health" | "/ready" | "/live" | FAVICON) {
        return false;
    }
    if let Some(route) = crate::route_target::parse_api_route(path) {
        if route.tail_path == "/health" || route.tail_path.starts_with("/health/") {
            return false;
        }
    }
    true
}

/// Derives the slug billed for this request: from the parsed route if present, else a
/// best-effort parse of `/api/<slug>/...`, stripping a legacy trailing `s` heuristic.
fn derive_slug(path: &str, route: Option<&RouteTarget>) -> String {
    if let Some(route) = route {
        return route.slug.clone();
    }

    let Some(rest) = path.strip_prefix("/api/") else {
        return "unknown".to_owned();
    };
    let raw_slug = rest.split('/').next().unwrap_or("unknown");
    raw_slug.strip_suffix('s').unwrap_or(raw_slug).to_owned()
}

/// Step 11 of the edge pipeline, grounded on the same single-owner / never-throw posture as
/// the rest of the audit path: whatever happens downstream, this middleware enqueues exactly
/// one [`AuditEvent`] (or none, if the request is ineligible) and never turns an audit failure
/// into a caller-visible error.
pub(crate) async fn audit_capture_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_owned();

    if !is_eligible(&path) {
        return next.run(request).await;
    }

    let method = request.method().to_string();
    let route = request.extensions().get::<RouteTarget>().cloned();
    let slug = derive_slug(&path, route.as_ref());
    let caller_ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .unwrap_or("unknown")
        .to_owned();

    let ts_start = OffsetDateTime::now_utc();
    let started_at = Instant::now();

    let response = next.run(request).await;

    // `audit_capture` runs outermost, before `request_id_middleware` has adopted or minted a
    // correlation id, so the id isn't on the request's extensions yet at this point — read it
    // back off the response header `request_id_middleware` echoes instead.
    let request_id = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| RequestId::unknown().0);

    let status = response.status();
    let duration_ms: u64 = started_at.elapsed().as_millis().try_into().unwrap_or(u64::MAX);

    if status == StatusCode::GATEWAY_TIMEOUT {
        emit_event(&state.wal, build_event(ts_start, duration_ms, request_id, method, path, slug, status, caller_ip, FinalizeReason::Timeout, false));
        return response;
    }

    let (parts, body) = response.into_parts();
    let tracked = TrackedBody::new(body, move |completed| {
        let reason = if completed { FinalizeReason::Finish } else { FinalizeReason::ClientAbort };
        emit_event(
            &state.wal,
            build_event(ts_start, duration_ms, request_id.clone(), method.clone(), path.clone(), slug.clone(), status, caller_ip.clone(), reason, completed),
        );
    });

    Response::from_parts(parts, Body::new(tracked))
}

#[allow(clippy::too_many_arguments)]
fn build_event(
    ts_start: OffsetDateTime,
    duration_ms: u64,
    request_id: String,
    method: String,
    path: String,
    slug: String,
    status: StatusCode,
    caller_ip: String,
    finalize_reason: FinalizeReason,
    duration_reliable: bool,
) -> AuditEvent {
    let mut meta = std::collections::BTreeMap::new();
    meta.insert("callerIp".to_owned(), caller_ip);
    meta.insert("s2sCaller".to_owned(), "gateway".to_owned());

    AuditEvent {
        event_id: Uuid::new_v4(),
        ts: OffsetDateTime::now_utc(),
        duration_ms,
        request_id,
        method,
        path,
        slug,
        status: status.as_u16(),
        billable_units: 1,
        ts_start: Some(ts_start),
        duration_reliable: Some(duration_reliable),
        finalize_reason: Some(finalize_reason),
        meta,
    }
}

fn emit_event(wal: &WalHandle, event: AuditEvent) {
    wal.enqueue(event);
}

pin_project_lite::pin_project! {
    /// Wraps an outgoing response body to tell `finish` (fully polled to end) apart from
    /// `client-abort` (dropped before the end-of-stream frame was produced) without buffering.
    struct TrackedBody<F: FnMut(bool)> {
        #[pin]
        inner: Body,
        completed: bool,
        on_finalize: Option<F>,
    }

    impl<F: FnMut(bool)> PinnedDrop for TrackedBody<F> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let Some(mut callback) = this.on_finalize.take() {
                callback(*this.completed);
            }
        }
    }
}

impl<F: FnMut(bool)> TrackedBody<F> {
    fn new(inner: Body, on_finalize: F) -> Self {
        Self {
            inner,
            completed: false,
            on_finalize: Some(on_finalize),
        }
    }
}

impl<F: FnMut(bool)> HttpBody for TrackedBody<F> {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();
        match this.inner.as_mut().poll_frame(cx) {
            Poll::Ready(None) => {
                *this.completed = true;
                if let Some(mut callback) = this.on_finalize.take() {
                    callback(true);
                }
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}
