use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::Response;
use tokio::time::Instant;

use crate::problem::GatewayError;
use crate::AppState;

/// `ip|method|normalizedPath`, per §4.6.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct RateLimitKey(pub IpAddr, pub Method, pub String);

struct Window {
    count: u32,
    window_started_at: Instant,
}

/// Fixed-window, in-memory rate limiter. Fails open: any internal inconsistency (a poisoned
/// lock would be the only way to hit one, since `parking_lot` never poisons) lets the request
/// through rather than denying traffic.
pub(crate) struct RateLimiter {
    points: u32,
    window: Duration,
    buckets: parking_lot::Mutex<HashMap<RateLimitKey, Window>>,
}

impl RateLimiter {
    pub(crate) fn new(points: u32, window: Duration) -> Self {
        Self {
            points,
            window,
            buckets: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Returns `Ok(())` if the call is allowed, `Err(retry_after)` if the key is over budget
    /// for the remainder of the current window.
    pub(crate) fn check(&self, key: RateLimitKey) -> Result<(), Duration> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();

        let entry = buckets.entry(key).or_insert_with(|| Window {
            count: 0,
            window_started_at: now,
        });

        if now.duration_since(entry.window_started_at) >= self.window {
            entry.count = 0;
            entry.window_started_at = now;
        }

        entry.count += 1;

        if entry.count > self.points {
            let elapsed = now.duration_since(entry.window_started_at);
            return Err(self.window.saturating_sub(elapsed));
        }

        Ok(())
    }
}

fn client_ip(request: &Request) -> IpAddr {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<std::net::SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        })
        .unwrap_or(IpAddr::from([0, 0, 0, 0]))
}

/// Step 5 of the edge pipeline.
pub(crate) async fn rate_limit_middleware(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, Response> {
    let normalized_path = svcmesh_svcconfig::normalize_path(request.uri().path());
    let key = RateLimitKey(client_ip(&request), request.method().clone(), normalized_path);

    match state.rate_limiter.check(key) {
        Ok(()) => Ok(next.run(request).await),
        Err(retry_after) => Err(crate::denied(&request, GatewayError::RateLimited { retry_after })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> RateLimitKey {
        RateLimitKey(IpAddr::from([127, 0, 0, 1]), Method::GET, "/api/demo/v1/widgets".to_owned())
    }

    #[test]
    fn allows_up_to_the_configured_points_then_denies_the_next_one() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));

        assert!(limiter.check(key()).is_ok());
        assert!(limiter.check(key()).is_ok());
        assert!(limiter.check(key()).is_ok());

        let retry_after = limiter.check(key()).expect_err("4th call within the window must be denied");
        assert!(retry_after <= Duration::from_secs(60));
    }

    #[test]
    fn a_fresh_window_resets_the_budget() {
        let limiter = RateLimiter::new(1, Duration::from_millis(20));

        assert!(limiter.check(key()).is_ok());
        assert!(limiter.check(key()).is_err());

        std::thread::sleep(Duration::from_millis(30));

        assert!(limiter.check(key()).is_ok(), "a new window must allow the request again");
    }

    #[test]
    fn distinct_keys_are_tracked_independently() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let other = RateLimitKey(IpAddr::from([10, 0, 0, 1]), Method::GET, "/api/demo/v1/widgets".to_owned());

        assert!(limiter.check(key()).is_ok());
        assert!(limiter.check(other).is_ok(), "a different key must not be affected by the first");
    }
}
