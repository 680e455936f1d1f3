use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::request_id::RequestId;

/// RFC 7807 `application/problem+json` body, per the edge's error response contract.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub instance: String,
    pub request_id: String,
}

impl ProblemDetails {
    pub(crate) fn new(
        status: StatusCode,
        problem_type: impl Into<String>,
        title: &str,
        detail: impl Into<String>,
        instance: impl Into<String>,
        request_id: &RequestId,
    ) -> Self {
        Self {
            problem_type: problem_type.into(),
            title: title.to_owned(),
            status: status.as_u16(),
            detail: detail.into(),
            instance: instance.into(),
            request_id: request_id.0.clone(),
        }
    }

    pub(crate) fn into_response_with(self, status: StatusCode) -> Response {
        let mut response = (status, Json(self)).into_response();
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

/// Error taxonomy from the error handling design: each variant carries the kind-specific
/// surface decided ahead of time rather than guessed at the response boundary.
#[derive(Debug, thiserror::Error)]
pub(crate) enum GatewayError {
    #[error("missing or invalid assertion")]
    AuthMissing,
    #[error("assertion claim mismatch")]
    AuthClaimMismatch,
    #[error("route policy resolution failed")]
    PolicyResolution(#[source] anyhow::Error),
    #[error("route policy is ambiguous")]
    PolicyAmbiguous,
    #[error("service unknown")]
    PolicyServiceUnknown,
    #[error("rate limit exceeded")]
    RateLimited { retry_after: Duration },
    #[error("read-only mode")]
    ReadOnly,
    #[error("upstream request timed out")]
    UpstreamTimeout,
    #[error("upstream connection failed")]
    UpstreamUnreachable,
    #[error("no route matched")]
    NotFound,
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

use std::time::Duration;

impl GatewayError {
    pub(crate) fn status(&self) -> StatusCode {
        match self {
            GatewayError::AuthMissing => StatusCode::UNAUTHORIZED,
            GatewayError::AuthClaimMismatch => StatusCode::FORBIDDEN,
            GatewayError::PolicyResolution(_) => StatusCode::BAD_GATEWAY,
            GatewayError::PolicyAmbiguous => StatusCode::BAD_GATEWAY,
            GatewayError::PolicyServiceUnknown => StatusCode::BAD_GATEWAY,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::ReadOnly => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamUnreachable => StatusCode::BAD_GATEWAY,
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn title(&self) -> &'static str {
        match self {
            GatewayError::AuthMissing => "authentication required",
            GatewayError::AuthClaimMismatch => "assertion rejected",
            GatewayError::PolicyResolution(_) => "route policy resolution failed",
            GatewayError::PolicyAmbiguous => "route policy is ambiguous",
            GatewayError::PolicyServiceUnknown => "service unknown",
            GatewayError::RateLimited { .. } => "rate limit exceeded",
            GatewayError::ReadOnly => "gateway is in read-only mode",
            GatewayError::UpstreamTimeout => "upstream timed out",
            GatewayError::UpstreamUnreachable => "upstream unreachable",
            GatewayError::NotFound => "no route matched",
            GatewayError::Internal(_) => "internal error",
        }
    }

    /// The machine-readable reason named in the error taxonomy, carried on the wire as the
    /// Problem+JSON `type`. Falls back to a generic `about:blank#<status>` for variants the
    /// taxonomy has no dedicated code for.
    fn code(&self) -> String {
        match self {
            GatewayError::PolicyAmbiguous => "POLICY_AMBIGUOUS".to_owned(),
            GatewayError::PolicyResolution(_) => "route_policy_resolution_failed".to_owned(),
            _ => format!("about:blank#{}", self.status().as_u16()),
        }
    }

    pub(crate) fn into_response(self, instance: &str, request_id: &RequestId) -> Response {
        if matches!(self, GatewayError::Internal(_) | GatewayError::PolicyResolution(_)) {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::warn!(error = %self, "request denied");
        }

        let status = self.status();
        let code = self.code();
        let title = self.title();
        let detail = self.to_string();
        let problem = ProblemDetails::new(status, code, title, detail, instance, request_id);
        let mut response = problem.into_response_with(status);

        if let GatewayError::RateLimited { retry_after } = &self {
            let secs = retry_after.as_secs_f64().ceil() as u64;
            if let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
            }
        }

        response
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        GatewayError::into_response(self, "", &RequestId::unknown())
    }
}
