use axum::body::Body;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;

/// Parsed `/api/:slug/:version/*` target. Set as a request extension by
/// [`route_extract_middleware`] so every downstream stage (policy gate, proxy, audit capture)
/// shares one parse of the path instead of re-deriving it.
#[derive(Debug, Clone)]
pub(crate) struct RouteTarget {
    pub slug: String,
    pub version: u32,
    pub tail_path: String,
}

/// Accepts `v1`, `V1`, `1`; rejects `v0`, `-1`, `v1.2`, and anything else that isn't a bare
/// positive integer with an optional single leading `v`/`V`.
pub(crate) fn parse_version(raw: &str) -> Option<u32> {
    let digits = raw.strip_prefix('v').or_else(|| raw.strip_prefix('V')).unwrap_or(raw);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let version: u32 = digits.parse().ok()?;
    if version == 0 {
        None
    } else {
        Some(version)
    }
}

pub(crate) fn parse_api_route(path: &str) -> Option<RouteTarget> {
    let rest = path.strip_prefix("/api/")?;
    let mut parts = rest.splitn(3, '/');
    let slug = parts.next()?;
    let version_raw = parts.next()?;
    let tail = parts.next().unwrap_or("");

    if slug.is_empty() {
        return None;
    }

    let version = parse_version(version_raw)?;

    Some(RouteTarget {
        slug: slug.to_owned(),
        version,
        tail_path: format!("/{tail}"),
    })
}

pub(crate) async fn route_extract_middleware(mut request: Request<Body>, next: Next) -> Response {
    if let Some(target) = parse_api_route(request.uri().path()) {
        request.extensions_mut().insert(target);
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_v1_upper_v1_and_bare_1() {
        assert_eq!(parse_version("v1"), Some(1));
        assert_eq!(parse_version("V1"), Some(1));
        assert_eq!(parse_version("1"), Some(1));
    }

    #[test]
    fn rejects_v0_negative_and_fractional() {
        assert_eq!(parse_version("v0"), None);
        assert_eq!(parse_version("-1"), None);
        assert_eq!(parse_version("v1.2"), None);
    }

    #[test]
    fn parses_slug_version_and_tail() {
        let route = parse_api_route("/api/accounts/v2/users/42").unwrap();
        assert_eq!(route.slug, "accounts");
        assert_eq!(route.version, 2);
        assert_eq!(route.tail_path, "/users/42");
    }

    #[test]
    fn tail_defaults_to_root_when_absent() {
        let route = parse_api_route("/api/accounts/v2").unwrap();
        assert_eq!(route.tail_path, "/");
    }
}
