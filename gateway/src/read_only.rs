use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::Response;

use crate::problem::GatewayError;
use crate::AppState;

/// `true` if a request with this method/path must be rejected while the gateway is read-only.
fn rejects(read_only_mode: bool, method: &Method, path: &str, exempt_prefixes: &[String]) -> bool {
    if !read_only_mode {
        return false;
    }

    let is_mutation = matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE);
    if !is_mutation {
        return false;
    }

    !exempt_prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
}

/// Step 6 of the edge pipeline. `READ_ONLY_MODE` is read fresh from the [`crate::config::ConfHandle`]
/// on every request, so flipping the flag never requires a restart of this middleware.
pub(crate) async fn read_only_middleware(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, Response> {
    let conf = state.conf.get_conf();
    let path = request.uri().path();

    if rejects(conf.gateway.read_only_mode, request.method(), path, &conf.gateway.read_only_exempt_prefixes) {
        Err(crate::denied(&request, GatewayError::ReadOnly))
    } else {
        Ok(next.run(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutations_pass_when_not_read_only() {
        assert!(!rejects(false, &Method::POST, "/api/demo/v1/widgets", &[]));
    }

    #[test]
    fn reads_always_pass_even_when_read_only() {
        assert!(!rejects(true, &Method::GET, "/api/demo/v1/widgets", &[]));
    }

    #[test]
    fn mutations_are_denied_when_read_only_and_not_exempt() {
        assert!(rejects(true, &Method::POST, "/api/demo/v1/widgets", &[]));
    }

    #[test]
    fn an_exempt_prefix_lets_mutations_through() {
        assert!(!rejects(true, &Method::DELETE, "/api/svcaudit/v1/events", &["/api/svcaudit".to_owned()]));
    }

    #[test]
    fn a_non_matching_prefix_does_not_exempt() {
        assert!(rejects(true, &Method::PUT, "/api/demo/v1/widgets", &["/api/svcaudit".to_owned()]));
    }
}
