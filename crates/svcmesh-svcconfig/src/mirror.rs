use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use svcmesh_task::{ShutdownSignal, Task};
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

use crate::error::ServiceUnknown;
use crate::facilitator::FetchSvcconfig;
use crate::types::{RoutePolicy, ServiceKey, SvcRecord, SvcconfigSnapshot};

struct MirrorInner {
    snapshot: parking_lot::RwLock<Arc<SvcconfigSnapshot>>,
}

/// Process-owned, replace-on-refresh directory of `(env, slug, version) -> SvcRecord`.
/// Readers take a snapshot reference once per request, so a refresh mid-request never tears
/// what they see. A failed refresh keeps the last good snapshot and logs a warning; it never
/// blocks or fails a reader.
#[derive(Clone)]
pub struct SvcconfigMirror {
    inner: Arc<MirrorInner>,
}

impl SvcconfigMirror {
    pub fn new(initial: Vec<SvcRecord>) -> Self {
        let snapshot = SvcconfigSnapshot::from_records(0, now(), initial);
        Self {
            inner: Arc::new(MirrorInner {
                snapshot: parking_lot::RwLock::new(Arc::new(snapshot)),
            }),
        }
    }

    pub fn snapshot(&self) -> Arc<SvcconfigSnapshot> {
        self.inner.snapshot.read().clone()
    }

    pub fn resolve_target(&self, env: &str, slug: &str, version: u32) -> Result<Arc<SvcRecord>, ServiceUnknown> {
        let snapshot = self.snapshot();
        snapshot
            .records
            .get(&ServiceKey::new(env, slug, version))
            .cloned()
            .map(Arc::new)
            .ok_or_else(|| ServiceUnknown {
                env: env.to_owned(),
                slug: slug.to_owned(),
                version,
            })
    }

    /// O(1) read of whatever `RoutePolicy` the current snapshot embeds for this service, with
    /// no network call. `None` means the registry entry has no embedded policy; callers fall
    /// back to the facilitator's dedicated `routePolicy` query (see `RoutePolicyGate`).
    pub fn route_policy_for(&self, env: &str, slug: &str, version: u32) -> Option<RoutePolicy> {
        self.snapshot()
            .records
            .get(&ServiceKey::new(env, slug, version))
            .and_then(|record| record.route_policy.clone())
    }

    fn replace(&self, records: Vec<SvcRecord>) {
        let revision = self.snapshot().revision + 1;
        *self.inner.snapshot.write() = Arc::new(SvcconfigSnapshot::from_records(revision, now(), records));
    }
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Background task that periodically pulls the full registry from the facilitator and swaps
/// it into the mirror. Grounded on the same `tokio::select!(sleep, shutdown)` shape the
/// teacher uses for its own periodic housekeeping tasks.
pub struct RefreshTask<F> {
    pub mirror: SvcconfigMirror,
    pub fetcher: Arc<F>,
    pub env: String,
    pub interval: Duration,
}

#[async_trait]
impl<F: FetchSvcconfig + 'static> Task for RefreshTask<F> {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "svcconfig mirror refresh";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!("task started");

        loop {
            refresh_once(&self.mirror, self.fetcher.as_ref(), &self.env).await;

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown_signal.wait() => break,
            }
        }

        debug!("task terminated");
        Ok(())
    }
}

#[instrument(skip(mirror, fetcher))]
async fn refresh_once<F: FetchSvcconfig + ?Sized>(mirror: &SvcconfigMirror, fetcher: &F, env: &str) {
    match fetcher.fetch_registry(env).await {
        Ok(records) => mirror.replace(records),
        Err(error) => warn!(%error, "svcconfig refresh failed, keeping last known-good snapshot"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::types::SvcRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(slug: &str, version: u32) -> SvcRecord {
        SvcRecord {
            env: "prod".into(),
            slug: slug.into(),
            version,
            base_url: format!("https://{slug}.internal"),
            internal_only: true,
            route_policy: None,
        }
    }

    #[test]
    fn resolve_target_finds_a_known_record() {
        let mirror = SvcconfigMirror::new(vec![record("user", 1)]);
        let resolved = mirror.resolve_target("prod", "user", 1).unwrap();
        assert_eq!(resolved.base_url, "https://user.internal");
    }

    #[test]
    fn resolve_target_rejects_an_unknown_service() {
        let mirror = SvcconfigMirror::new(vec![record("user", 1)]);
        let err = mirror.resolve_target("prod", "user", 2).unwrap_err();
        assert_eq!(err.version, 2);
    }

    struct FailingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FetchSvcconfig for FailingFetcher {
        async fn fetch_registry(&self, _env: &str) -> Result<Vec<SvcRecord>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::Rejected { status: 503 })
        }
    }

    #[tokio::test]
    async fn a_failed_refresh_keeps_the_last_good_snapshot() {
        let mirror = SvcconfigMirror::new(vec![record("user", 1)]);
        let fetcher = FailingFetcher { calls: AtomicUsize::new(0) };

        refresh_once(&mirror, &fetcher, "prod").await;

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(mirror.resolve_target("prod", "user", 1).is_ok());
        assert_eq!(mirror.snapshot().revision, 0);
    }
}
