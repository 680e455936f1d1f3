use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use serde_json::Map;

use crate::policy::CallerAssertion;
use crate::problem::GatewayError;
use crate::request_id::RequestId;
use crate::route_target::RouteTarget;
use crate::AppState;

const HOP_BY_HOP: &[&str] = &["connection", "transfer-encoding", "keep-alive", "upgrade", "te", "host"];

fn is_hop_by_hop_or_proxy(name: &str) -> bool {
    HOP_BY_HOP.contains(&name) || name.starts_with("proxy-")
}

fn sanitize_inbound_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        let lower = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop_or_proxy(&lower) || lower == "authorization" {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(name, value);
        }
    }
    out
}

fn sanitize_outbound_headers(headers: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop_or_proxy(&lower) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_str().as_bytes()), HeaderValue::from_bytes(value.as_bytes())) {
            out.append(name, value);
        }
    }
    out
}

/// Steps 9 (identity injection) and 10 (S2S proxy) of the edge pipeline, as a single terminal
/// handler: there is no "next" stage after the proxy call returns, so splitting them into two
/// middleware would just move state from a local variable into a request extension.
pub(crate) async fn proxy_handler(State(state): State<AppState>, request: Request) -> Result<Response, Response> {
    let conf = state.conf.get_conf();
    let request_id = request.extensions().get::<RequestId>().cloned().unwrap_or(RequestId("unknown".to_owned()));
    let caller_sub = request.extensions().get::<CallerAssertion>().map(|c| c.sub.clone()).unwrap_or_else(|| "anonymous".to_owned());

    let Some(route) = request.extensions().get::<RouteTarget>().cloned() else {
        return Err(crate::denied(&request, GatewayError::NotFound));
    };

    let target = state
        .mirror
        .resolve_target(&conf.svcconfig.env, &route.slug, route.version)
        .map_err(|_source| crate::denied(&request, GatewayError::PolicyServiceUnknown))?;

    let method = request.method().clone();
    let mut upstream_headers = sanitize_inbound_headers(request.headers());

    let s2s_token = state
        .minter
        .mint(&route.slug, &conf.gateway.service_name, Duration::from_secs(60), Map::new())
        .await
        .map_err(|source| crate::denied(&request, GatewayError::Internal(source.into())))?;
    upstream_headers.insert(
        reqwest::header::AUTHORIZATION,
        reqwest::header::HeaderValue::from_str(&format!("Bearer {s2s_token}")).expect("bearer header is ASCII"),
    );

    let user_assertion = state
        .minter
        .mint(&route.slug, &caller_sub, Duration::from_secs(60), Map::new())
        .await
        .map_err(|source| crate::denied(&request, GatewayError::Internal(source.into())))?;
    if let Ok(value) = reqwest::header::HeaderValue::from_str(&user_assertion) {
        upstream_headers.insert(reqwest::header::HeaderName::from_static("x-nv-user-assertion"), value);
    }

    if let Ok(value) = reqwest::header::HeaderValue::from_str(&request_id.0) {
        upstream_headers.insert(reqwest::header::HeaderName::from_static("x-request-id"), value);
    }
    upstream_headers.insert(
        reqwest::header::HeaderName::from_static("x-nv-api-version"),
        reqwest::header::HeaderValue::from_str(&format!("v{}", route.version)).expect("version header is ASCII"),
    );
    upstream_headers.insert(
        reqwest::header::HeaderName::from_static("x-service-name"),
        reqwest::header::HeaderValue::from_str(&conf.gateway.service_name).expect("service name is ASCII"),
    );

    let query = request.uri().query().map(|q| format!("?{q}")).unwrap_or_default();
    let upstream_url = format!("{}{}{}", target.base_url.trim_end_matches('/'), route.tail_path, query);

    let has_body = !matches!(method, axum::http::Method::GET | axum::http::Method::HEAD);
    let body = if has_body {
        reqwest::Body::wrap_stream(request.into_body().into_data_stream())
    } else {
        reqwest::Body::from(Vec::new())
    };

    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes()).expect("axum and reqwest share method tokens");

    let upstream_response = state
        .http_client
        .request(reqwest_method, &upstream_url)
        .headers(upstream_headers)
        .timeout(conf.gateway.internal_proxy_timeout)
        .body(body)
        .send()
        .await;

    let upstream_response = match upstream_response {
        Ok(response) => response,
        Err(source) if source.is_timeout() => {
            return Err(GatewayError::UpstreamTimeout.into_response(&route.tail_path, &request_id));
        }
        Err(source) if source.is_connect() => {
            return Err(GatewayError::UpstreamUnreachable.into_response(&route.tail_path, &request_id));
        }
        Err(source) => {
            tracing::warn!(error = %source, "upstream request failed");
            return Err(GatewayError::UpstreamUnreachable.into_response(&route.tail_path, &request_id));
        }
    };

    let status = StatusCode::from_u16(upstream_response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let headers = sanitize_outbound_headers(upstream_response.headers());
    let body = Body::from_stream(upstream_response.bytes_stream());

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;

    Ok(response)
}
