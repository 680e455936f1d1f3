use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use serde::Deserialize;

use crate::error::FetchError;
use crate::types::{SvcRecord, UserAssertion};

/// Port `SvcconfigMirror` depends on to pull the full directory snapshot. Lets tests swap in
/// a canned fixture instead of a real facilitator.
#[async_trait]
pub trait FetchSvcconfig: Send + Sync {
    async fn fetch_registry(&self, env: &str) -> Result<Vec<SvcRecord>, FetchError>;
}

/// A single resolved decision for one `(env, slug, version, method, path)`, as returned by the
/// facilitator's `routePolicy` endpoint — already precedence-resolved server-side.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedPolicy {
    pub min_access_level: u32,
    pub public: bool,
    pub user_assertion: UserAssertion,
}

/// Port `RoutePolicyGate` depends on for services whose registry entry carries no embedded
/// [`crate::types::RoutePolicy`].
#[async_trait]
pub trait FetchRoutePolicy: Send + Sync {
    async fn fetch_route_policy(
        &self,
        env: &str,
        slug: &str,
        version: u32,
        method: &Method,
        path: &str,
    ) -> Result<Option<ResolvedPolicy>, FetchError>;
}

#[derive(Deserialize)]
struct RegistryResponse {
    records: Vec<SvcRecord>,
}

#[derive(Deserialize)]
struct RoutePolicyEnvelope {
    ok: bool,
    data: Option<RoutePolicyData>,
}

#[derive(Deserialize)]
struct RoutePolicyData {
    policy: RoutePolicyFragment,
}

#[derive(Deserialize)]
struct RoutePolicyFragment {
    #[serde(rename = "minAccessLevel")]
    min_access_level: u32,
    public: bool,
    #[serde(rename = "userAssertion")]
    user_assertion: UserAssertion,
}

/// `reqwest`-based client for the svcconfig facilitator, signing every call with a short-lived
/// S2S assertion.
pub struct FacilitatorClient {
    client: reqwest::Client,
    base_url: String,
    minter: Arc<svcmesh_s2s::S2SMinter>,
    target_slug: String,
    timeout: Duration,
}

impl FacilitatorClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, minter: Arc<svcmesh_s2s::S2SMinter>, target_slug: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            minter,
            target_slug: target_slug.into(),
            timeout,
        }
    }

    async fn bearer(&self) -> Result<String, FetchError> {
        let token = self
            .minter
            .mint(&self.target_slug, "svcmesh-svcconfig", Duration::from_secs(60), serde_json::Map::new())
            .await?;
        Ok(format!("Bearer {token}"))
    }
}

#[async_trait]
impl FetchSvcconfig for FacilitatorClient {
    async fn fetch_registry(&self, env: &str) -> Result<Vec<SvcRecord>, FetchError> {
        let url = format!("{}/api/svcfacilitator/v1/registry", self.base_url);
        let response = self
            .client
            .get(url)
            .query(&[("env", env)])
            .header(reqwest::header::AUTHORIZATION, self.bearer().await?)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|source| FetchError::Transport(source.into()))?;

        if !response.status().is_success() {
            return Err(FetchError::Rejected {
                status: response.status().as_u16(),
            });
        }

        let body: RegistryResponse = response.json().await.map_err(|source| FetchError::Transport(source.into()))?;
        Ok(body.records)
    }
}

#[async_trait]
impl FetchRoutePolicy for FacilitatorClient {
    async fn fetch_route_policy(
        &self,
        env: &str,
        slug: &str,
        version: u32,
        method: &Method,
        path: &str,
    ) -> Result<Option<ResolvedPolicy>, FetchError> {
        let url = format!("{}/api/svcfacilitator/v1/routePolicy", self.base_url);
        let version = version.to_string();
        let response = self
            .client
            .get(url)
            .query(&[
                ("env", env),
                ("slug", slug),
                ("version", version.as_str()),
                ("method", method.as_str()),
                ("path", path),
            ])
            .header(reqwest::header::AUTHORIZATION, self.bearer().await?)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|source| FetchError::Transport(source.into()))?;

        if !response.status().is_success() {
            return Err(FetchError::Rejected {
                status: response.status().as_u16(),
            });
        }

        let body: RoutePolicyEnvelope = response.json().await.map_err(|source| FetchError::Transport(source.into()))?;

        if !body.ok {
            return Ok(None);
        }

        Ok(body.data.map(|data| ResolvedPolicy {
            min_access_level: data.policy.min_access_level,
            public: data.policy.public,
            user_assertion: data.policy.user_assertion,
        }))
    }
}
