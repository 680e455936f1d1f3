use axum::extract::{Request, State};
use axum::http::Method;
use axum_extra::headers::HeaderMapExt as _;
use axum::middleware::Next;
use axum::response::Response;
use svcmesh_s2s::VerifyError;
use svcmesh_svcconfig::{normalize_path, GateDecision, PolicyError};

use crate::problem::GatewayError;
use crate::route_target::RouteTarget;
use crate::AppState;

/// The verified caller identity, stashed as a request extension after the auth gate runs so
/// later stages (identity injection, audit capture) don't re-parse the header.
#[derive(Debug, Clone)]
pub(crate) struct CallerAssertion {
    pub sub: String,
}

const USER_ASSERTION_HEADER: &str = "x-nv-user-assertion";

/// Steps 7 (auth gate) and 8 (route policy gate), combined: the policy decision determines
/// whether a bearer is required before we bother verifying one.
pub(crate) async fn auth_and_policy_middleware(State(state): State<AppState>, mut request: Request, next: Next) -> Result<Response, Response> {
    let Some(route) = request.extensions().get::<RouteTarget>().cloned() else {
        // Not an `/api/:slug/:version/*` request (health or a 404 candidate); nothing to gate.
        return Ok(next.run(request).await);
    };

    let method = request.method().clone();
    let normalized_path = normalize_path(&route.tail_path);

    let assertion_header = request
        .headers()
        .typed_get::<axum_extra::headers::Authorization<axum_extra::headers::authorization::Bearer>>();
    let user_assertion_raw = request
        .headers()
        .get(USER_ASSERTION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned);

    let has_bearer = user_assertion_raw.is_some() || assertion_header.is_some();

    let decision = state
        .policy_gate
        .decide(&state.conf.get_conf().svcconfig.env, &route.slug, route.version, &method, &normalized_path, has_bearer)
        .await
        .map_err(|source| {
            let error = match source {
                PolicyError::Ambiguous { .. } => GatewayError::PolicyAmbiguous,
                other => GatewayError::PolicyResolution(other.into()),
            };
            crate::denied(&request, error)
        })?;

    match decision {
        GateDecision::Bypass => Ok(next.run(request).await),
        GateDecision::Deny { status, .. } => {
            let error = if status == 403 { GatewayError::AuthClaimMismatch } else { GatewayError::AuthMissing };
            Err(crate::denied(&request, error))
        }
        GateDecision::Allow { .. } => {
            let public_get = method == Method::GET && state.conf.get_conf().gateway.auth_public_prefixes.iter().any(|p| normalized_path.starts_with(p.as_str()));
            let force_auth = state
                .conf
                .get_conf()
                .gateway
                .public_get_require_auth_prefixes
                .iter()
                .any(|p| normalized_path.starts_with(p.as_str()));

            let must_verify = !public_get || force_auth || method != Method::GET;

            if !must_verify && !has_bearer {
                return Ok(next.run(request).await);
            }

            let Some(user_assertion) = user_assertion_raw else {
                return Err(crate::denied(&request, GatewayError::AuthMissing));
            };

            let claims = state.verifier.verify(&user_assertion).await.map_err(|source| {
                let error = if source.is_claim_mismatch() {
                    GatewayError::AuthClaimMismatch
                } else if matches!(source, VerifyError::JwksUnavailable { .. }) {
                    GatewayError::PolicyResolution(source.into())
                } else {
                    GatewayError::AuthMissing
                };
                crate::denied(&request, error)
            })?;

            request.extensions_mut().insert(CallerAssertion { sub: claims.sub });

            Ok(next.run(request).await)
        }
    }
}
