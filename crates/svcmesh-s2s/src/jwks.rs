use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use picky::jose::jwk::JwkSet;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::JwksError;
use crate::jwk::jwk_from_public_key_pem;
use crate::signer::KeySigner;

/// Where a [`JwksCache`] pulls a fresh [`JwkSet`] from when its TTL expires.
#[async_trait]
pub trait JwksSource: Send + Sync {
    async fn fetch(&self) -> Result<JwkSet, JwksError>;
}

/// Publishes this process's own signing key(s) as a [`JwkSet`] — the source behind
/// `/.well-known/jwks.json`.
pub struct LocalJwksSource {
    signers: Vec<Arc<dyn KeySigner>>,
}

impl LocalJwksSource {
    pub fn new(signers: Vec<Arc<dyn KeySigner>>) -> Self {
        Self { signers }
    }
}

#[async_trait]
impl JwksSource for LocalJwksSource {
    async fn fetch(&self) -> Result<JwkSet, JwksError> {
        let keys = self
            .signers
            .iter()
            .map(|signer| jwk_from_public_key_pem(signer.public_key_pem(), signer.key_handle()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(JwkSet { keys })
    }
}

/// Fetches another service's JWKS document over HTTP — what [`crate::verifier::S2SVerifier`]
/// uses to resolve the public key for an inbound token's `kid`.
pub struct RemoteJwksSource {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl RemoteJwksSource {
    pub fn new(client: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl JwksSource for RemoteJwksSource {
    async fn fetch(&self) -> Result<JwkSet, JwksError> {
        let response = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|source| JwksError::Unavailable { source: source.into() })?;

        if !response.status().is_success() {
            return Err(JwksError::Unavailable {
                source: anyhow::anyhow!("JWKS endpoint returned {}", response.status()),
            });
        }

        response
            .json::<JwkSet>()
            .await
            .map_err(|source| JwksError::Unavailable { source: source.into() })
    }
}

struct CacheEntry {
    value: JwkSet,
    expires_at: Instant,
}

/// TTL cache over a [`JwksSource`], single-flight by construction: concurrent callers block on
/// the same refresh rather than issuing duplicate fetches. Never serves a stale value once
/// expired — a cold cache whose refresh fails surfaces [`JwksError::Unavailable`].
pub struct JwksCache<S> {
    source: S,
    ttl: Duration,
    entry: Mutex<Option<CacheEntry>>,
}

impl<S: JwksSource> JwksCache<S> {
    pub fn new(source: S, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            entry: Mutex::new(None),
        }
    }

    /// Returns the cached set, refreshing first if expired or absent.
    pub async fn get_jwks(&self) -> Result<JwkSet, JwksError> {
        let mut guard = self.entry.lock().await;

        if let Some(entry) = guard.as_ref() {
            if Instant::now() < entry.expires_at {
                return Ok(entry.value.clone());
            }
        }

        let value = self.source.fetch().await?;
        *guard = Some(CacheEntry {
            value: value.clone(),
            expires_at: Instant::now() + self.ttl,
        });

        Ok(value)
    }

    /// Forces the next [`Self::get_jwks`] call to refresh. Exists for rotation tests.
    pub async fn expire_now(&self) {
        *self.entry.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyhandle::KeyHandle;
    use crate::signer::test_support::LocalKeySigner;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        inner: LocalJwksSource,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JwksSource for CountingSource {
        async fn fetch(&self) -> Result<JwkSet, JwksError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch().await
        }
    }

    fn make_signer(version: &str) -> Arc<dyn KeySigner> {
        Arc::new(LocalKeySigner::generate(KeyHandle::new("p", "l", "r", "k", version)))
    }

    #[tokio::test]
    async fn refreshes_once_until_ttl_expires() {
        let source = CountingSource {
            inner: LocalJwksSource::new(vec![make_signer("1")]),
            calls: AtomicUsize::new(0),
        };
        let cache = JwksCache::new(source, Duration::from_secs(3600));

        cache.get_jwks().await.unwrap();
        cache.get_jwks().await.unwrap();
        cache.get_jwks().await.unwrap();

        assert_eq!(cache.source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expire_now_forces_a_refetch() {
        let source = CountingSource {
            inner: LocalJwksSource::new(vec![make_signer("1")]),
            calls: AtomicUsize::new(0),
        };
        let cache = JwksCache::new(source, Duration::from_secs(3600));

        cache.get_jwks().await.unwrap();
        cache.expire_now().await;
        cache.get_jwks().await.unwrap();

        assert_eq!(cache.source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn jwks_set_is_never_empty_for_a_running_signer() {
        let cache = JwksCache::new(LocalJwksSource::new(vec![make_signer("1")]), Duration::from_secs(60));
        let set = cache.get_jwks().await.unwrap();
        assert_eq!(set.keys.len(), 1);
    }
}
