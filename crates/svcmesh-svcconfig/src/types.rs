use std::collections::HashMap;

use http::Method;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Whether a matched route requires, accepts, or rejects an end-user assertion
/// (`X-NV-User-Assertion`), independent of the S2S bearer carried on every proxied call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UserAssertion {
    Required,
    Optional,
    Forbidden,
}

/// One rule in a [`RoutePolicy`]. `method: None` matches any method; `version: None` matches
/// any version of the owning slug. Both are resolved against "exact beats wildcard" before
/// falling back to longest-prefix, per [`crate::policy::RoutePolicyGate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    #[serde(with = "method_opt", default)]
    pub method: Option<Method>,
    pub version: Option<u32>,
    pub path_prefix: String,
    pub public: bool,
    pub user_assertion: UserAssertion,
    pub min_access_level: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PolicyDefaults {
    pub public: bool,
    pub user_assertion: UserAssertion,
}

/// `{ revision, defaults, rules }`. Loaded once per [`SvcRecord`]; the gate never mutates it,
/// only replaces it wholesale on mirror refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePolicy {
    pub revision: u64,
    pub defaults: PolicyDefaults,
    pub rules: Vec<RouteRule>,
}

/// `{ env, slug, version, baseUrl, internalOnly, routePolicy? }`, uniquely keyed by
/// `(env, slug, version)`. `base_url` is always absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvcRecord {
    pub env: String,
    pub slug: String,
    pub version: u32,
    pub base_url: String,
    pub internal_only: bool,
    pub route_policy: Option<RoutePolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub env: String,
    pub slug: String,
    pub version: u32,
}

impl ServiceKey {
    pub fn new(env: impl Into<String>, slug: impl Into<String>, version: u32) -> Self {
        Self {
            env: env.into(),
            slug: slug.into(),
            version,
        }
    }
}

/// The type behind the atomic pointer swap in [`crate::mirror::SvcconfigMirror`]. `revision`
/// is a monotonic counter bumped on every successful refresh.
#[derive(Debug, Clone)]
pub struct SvcconfigSnapshot {
    pub revision: u64,
    pub fetched_at: OffsetDateTime,
    pub records: HashMap<ServiceKey, SvcRecord>,
}

impl SvcconfigSnapshot {
    pub fn from_records(revision: u64, fetched_at: OffsetDateTime, records: Vec<SvcRecord>) -> Self {
        let records = records
            .into_iter()
            .map(|record| (ServiceKey::new(&record.env, &record.slug, record.version), record))
            .collect();

        Self {
            revision,
            fetched_at,
            records,
        }
    }
}

mod method_opt {
    use http::Method;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub(super) fn serialize<S: Serializer>(method: &Option<Method>, serializer: S) -> Result<S::Ok, S::Error> {
        method.as_ref().map(Method::as_str).serialize(serializer)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Method>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| Method::from_bytes(s.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}
