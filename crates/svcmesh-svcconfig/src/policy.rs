use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use tokio::time::Instant;

use crate::error::PolicyError;
use crate::facilitator::{FetchRoutePolicy, ResolvedPolicy};
use crate::mirror::SvcconfigMirror;
use crate::types::RoutePolicy;

/// Outcome of a `RoutePolicyGate::decide` call. `Bypass` short-circuits the rest of the
/// pipeline (health checks); `Deny` carries the machine-readable reason the spec's error
/// taxonomy maps to a status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Bypass,
    Allow { min_access_level: u32 },
    Deny { reason: &'static str, status: u16 },
}

/// `path` relative to the `/api/:slug/:version` root: leading slash, no trailing slash unless
/// it's the root itself, preserved case.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_owned()
    } else if trimmed.starts_with('/') {
        trimmed.to_owned()
    } else {
        format!("/{trimmed}")
    }
}

fn is_health_path(normalized_path: &str) -> bool {
    normalized_path == "/health" || normalized_path.starts_with("/health/")
}

#[derive(Clone, Copy)]
struct Candidate {
    version_exact: bool,
    method_exact: bool,
    prefix_len: usize,
    resolved: ResolvedPolicyInner,
}

#[derive(Debug, Clone, Copy)]
struct ResolvedPolicyInner {
    min_access_level: u32,
    public: bool,
}

fn prefix_matches(path: &str, prefix: &str) -> bool {
    if !path.starts_with(prefix) {
        return false;
    }
    prefix.ends_with('/') || path.len() == prefix.len() || path.as_bytes()[prefix.len()] == b'/'
}

/// Implements §4.5's precedence: exact version beats "any version", explicit method beats
/// "any method", longest path prefix wins among remaining ties. An unresolved tie between
/// two otherwise-equal candidates is a hard error — fail closed rather than guess.
fn match_rule(policy: &RoutePolicy, version: u32, method: &Method, path: &str) -> Result<Option<ResolvedPolicyInner>, PolicyError> {
    let candidates: Vec<Candidate> = policy
        .rules
        .iter()
        .filter(|rule| rule.version.is_none_or(|v| v == version))
        .filter(|rule| rule.method.as_ref().is_none_or(|m| m == method))
        .filter(|rule| prefix_matches(path, &rule.path_prefix))
        .map(|rule| Candidate {
            version_exact: rule.version == Some(version),
            method_exact: rule.method.as_ref() == Some(method),
            prefix_len: rule.path_prefix.len(),
            resolved: ResolvedPolicyInner {
                min_access_level: rule.min_access_level,
                public: rule.public,
            },
        })
        .collect();

    let Some(winner) = candidates.iter().max_by_key(|candidate| score(candidate)).copied() else {
        return Ok(None);
    };

    let tied = candidates.iter().filter(|candidate| score(candidate) == score(&winner)).count();
    if tied > 1 {
        return Err(PolicyError::Ambiguous {
            method: method.to_string(),
            path: path.to_owned(),
        });
    }

    Ok(Some(winner.resolved))
}

fn score(candidate: &Candidate) -> (bool, bool, usize) {
    (candidate.version_exact, candidate.method_exact, candidate.prefix_len)
}

struct CacheEntry {
    value: Option<ResolvedPolicy>,
    expires_at: Instant,
}

#[derive(Hash, PartialEq, Eq, Clone)]
struct CacheKey {
    env: String,
    slug: String,
    version: u32,
    method: String,
    path: String,
}

/// Resolves per-request access policy, combining the mirror's embedded `RoutePolicy` (local,
/// O(1)) with the facilitator's dedicated `routePolicy` query as a fallback for services that
/// don't embed one, all behind a per-process TTL cache keyed by
/// `(env, slug, version, method, normalizedPath)`. Negative results are cached too, so a
/// storm of requests for an unpoliced path costs at most one resolution per TTL window.
pub struct RoutePolicyGate<F> {
    mirror: SvcconfigMirror,
    fetcher: Arc<F>,
    ttl: Duration,
    cache: parking_lot::Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl<F: FetchRoutePolicy> RoutePolicyGate<F> {
    pub fn new(mirror: SvcconfigMirror, fetcher: Arc<F>, ttl: Duration) -> Self {
        Self {
            mirror,
            fetcher,
            ttl,
            cache: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub async fn decide(&self, env: &str, slug: &str, version: u32, method: &Method, path: &str, has_bearer: bool) -> Result<GateDecision, PolicyError> {
        let normalized_path = normalize_path(path);

        if is_health_path(&normalized_path) {
            return Ok(GateDecision::Bypass);
        }

        let resolved = self.resolve(env, slug, version, method, &normalized_path).await?;
        Ok(apply_decision(resolved, has_bearer))
    }

    async fn resolve(&self, env: &str, slug: &str, version: u32, method: &Method, normalized_path: &str) -> Result<Option<ResolvedPolicy>, PolicyError> {
        let key = CacheKey {
            env: env.to_owned(),
            slug: slug.to_owned(),
            version,
            method: method.to_string(),
            path: normalized_path.to_owned(),
        };

        if let Some(entry) = self.cache.lock().get(&key) {
            if Instant::now() < entry.expires_at {
                return Ok(entry.value);
            }
        }

        let value = match self.mirror.route_policy_for(env, slug, version) {
            Some(policy) => match_rule(&policy, version, method, normalized_path)?.map(|resolved| ResolvedPolicy {
                min_access_level: resolved.min_access_level,
                public: resolved.public,
                user_assertion: crate::types::UserAssertion::Optional,
            }),
            None => self
                .fetcher
                .fetch_route_policy(env, slug, version, method, normalized_path)
                .await
                .map_err(|source| PolicyError::ResolutionFailed {
                    method: method.to_string(),
                    path: normalized_path.to_owned(),
                    source,
                })?,
        };

        self.cache.lock().insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );

        Ok(value)
    }
}

fn apply_decision(resolved: Option<ResolvedPolicy>, has_bearer: bool) -> GateDecision {
    match resolved {
        None => {
            if has_bearer {
                GateDecision::Allow { min_access_level: 0 }
            } else {
                GateDecision::Deny {
                    reason: "private_by_default_no_policy",
                    status: 401,
                }
            }
        }
        Some(policy) => {
            if has_bearer {
                GateDecision::Allow {
                    min_access_level: policy.min_access_level,
                }
            } else if policy.public && policy.min_access_level == 0 {
                GateDecision::Allow { min_access_level: 0 }
            } else {
                GateDecision::Deny {
                    reason: "policy_requires_token",
                    status: 401,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PolicyDefaults, RouteRule, UserAssertion};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy_with_rules(rules: Vec<RouteRule>) -> RoutePolicy {
        RoutePolicy {
            revision: 1,
            defaults: PolicyDefaults {
                public: false,
                user_assertion: UserAssertion::Optional,
            },
            rules,
        }
    }

    fn rule(method: Option<Method>, version: Option<u32>, prefix: &str, public: bool, min_access_level: u32) -> RouteRule {
        RouteRule {
            method,
            version,
            path_prefix: prefix.to_owned(),
            public,
            user_assertion: UserAssertion::Optional,
            min_access_level,
        }
    }

    #[test]
    fn exact_version_beats_any_version() {
        let policy = policy_with_rules(vec![
            rule(None, None, "/users", true, 0),
            rule(None, Some(1), "/users", false, 5),
        ]);
        let resolved = match_rule(&policy, 1, &Method::GET, "/users").unwrap().unwrap();
        assert_eq!(resolved.min_access_level, 5);
    }

    #[test]
    fn longest_prefix_wins_among_equal_specificity() {
        let policy = policy_with_rules(vec![rule(None, None, "/users", true, 0), rule(None, None, "/users/admin", false, 9)]);
        let resolved = match_rule(&policy, 1, &Method::GET, "/users/admin/list").unwrap().unwrap();
        assert_eq!(resolved.min_access_level, 9);
    }

    #[test]
    fn a_true_tie_is_a_hard_error() {
        let policy = policy_with_rules(vec![rule(None, None, "/users", true, 0), rule(None, None, "/users", false, 9)]);
        let err = match_rule(&policy, 1, &Method::GET, "/users").unwrap_err();
        assert!(matches!(err, PolicyError::Ambiguous { .. }));
    }

    #[test]
    fn no_bearer_and_no_matching_rule_denies() {
        let policy = policy_with_rules(vec![]);
        let resolved = match_rule(&policy, 1, &Method::GET, "/orders").unwrap();
        assert!(resolved.is_none());
    }

    #[test]
    fn health_paths_bypass_without_touching_policy() {
        assert!(is_health_path(&normalize_path("/health/live")));
        assert!(is_health_path(&normalize_path("/health")));
        assert!(!is_health_path(&normalize_path("/healthcheck")));
    }

    struct CountingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FetchRoutePolicy for CountingFetcher {
        async fn fetch_route_policy(&self, _env: &str, _slug: &str, _version: u32, _method: &Method, _path: &str) -> Result<Option<ResolvedPolicy>, crate::error::FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    #[tokio::test]
    async fn identical_requests_within_ttl_trigger_one_facilitator_fetch() {
        let mirror = SvcconfigMirror::new(vec![]);
        let fetcher = Arc::new(CountingFetcher { calls: AtomicUsize::new(0) });
        let gate = RoutePolicyGate::new(mirror, fetcher.clone(), Duration::from_secs(60));

        for _ in 0..5 {
            gate.decide("prod", "act", 1, &Method::POST, "/acts", false).await.unwrap();
        }

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bearer_allows_even_with_no_policy() {
        let mirror = SvcconfigMirror::new(vec![]);
        let fetcher = Arc::new(CountingFetcher { calls: AtomicUsize::new(0) });
        let gate = RoutePolicyGate::new(mirror, fetcher, Duration::from_secs(60));

        let decision = gate.decide("prod", "act", 1, &Method::POST, "/acts", true).await.unwrap();
        assert_eq!(decision, GateDecision::Allow { min_access_level: 0 });
    }

    #[tokio::test]
    async fn no_bearer_and_no_policy_is_denied() {
        let mirror = SvcconfigMirror::new(vec![]);
        let fetcher = Arc::new(CountingFetcher { calls: AtomicUsize::new(0) });
        let gate = RoutePolicyGate::new(mirror, fetcher, Duration::from_secs(60));

        let decision = gate.decide("prod", "act", 1, &Method::POST, "/acts", false).await.unwrap();
        assert_eq!(
            decision,
            GateDecision::Deny {
                reason: "private_by_default_no_policy",
                status: 401
            }
        );
    }
}
