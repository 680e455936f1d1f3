use std::sync::Arc;
use std::time::Duration;

use svcmesh_s2s::S2SMinter;

use crate::error::DispatchError;
use crate::types::AuditEvent;

/// How the WAL should react to a batch send outcome, per §4.12's return classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Ok,
    NonRetriable,
    Retriable,
}

pub struct DispatcherConfig {
    pub sink_url: String,
    pub target_slug: String,
    pub service_name: String,
    pub api_version: u32,
    pub ndjson: bool,
    pub timeout: Duration,
}

/// Sends batches of `AuditEvent` to the audit sink over S2S. Stateless beyond its config and
/// the minter it shares with the rest of the process.
pub struct AuditDispatcher {
    client: reqwest::Client,
    minter: Arc<S2SMinter>,
    config: DispatcherConfig,
}

impl AuditDispatcher {
    pub fn new(client: reqwest::Client, minter: Arc<S2SMinter>, config: DispatcherConfig) -> Self {
        Self { client, minter, config }
    }

    /// Empty input is a no-op per §4.12 ("Empty input is a no-op (204)"): no network call, no
    /// token minted.
    pub async fn send(&self, events: &[AuditEvent]) -> DispatchOutcome {
        if events.is_empty() {
            return DispatchOutcome::Ok;
        }

        match self.try_send(events).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::warn!(%error, "audit sink dispatch failed, treating as retriable");
                DispatchOutcome::Retriable
            }
        }
    }

    async fn try_send(&self, events: &[AuditEvent]) -> Result<DispatchOutcome, DispatchError> {
        let token = self
            .minter
            .mint(&self.config.target_slug, &self.config.service_name, Duration::from_secs(60), serde_json::Map::new())
            .await?;

        let (content_type, body) = if self.config.ndjson {
            let mut buf = Vec::new();
            for event in events {
                serde_json::to_writer(&mut buf, event).map_err(|source| DispatchError::Transport(source.into()))?;
                buf.push(b'\n');
            }
            ("application/x-ndjson", buf)
        } else {
            let buf = serde_json::to_vec(events).map_err(|source| DispatchError::Transport(source.into()))?;
            ("application/json", buf)
        };

        let response = self
            .client
            .put(&self.config.sink_url)
            .timeout(self.config.timeout)
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {token}"))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header("x-service-name", &self.config.service_name)
            .header("x-nv-api-version", format!("v{}", self.config.api_version))
            .body(body)
            .send()
            .await
            .map_err(|source| DispatchError::Transport(source.into()))?;

        let status = response.status();
        Ok(if status.is_success() {
            DispatchOutcome::Ok
        } else if status.is_client_error() {
            DispatchOutcome::NonRetriable
        } else {
            DispatchOutcome::Retriable
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let signer: Arc<dyn svcmesh_s2s::KeySigner> = Arc::new(svcmesh_s2s::signer::test_support::LocalKeySigner::generate(
            svcmesh_s2s::KeyHandle::new("p", "l", "r", "k", "1"),
        ));
        let minter = Arc::new(S2SMinter::new(signer, "gateway", Duration::from_secs(60), Duration::from_secs(30)).unwrap());
        let dispatcher = AuditDispatcher::new(
            reqwest::Client::new(),
            minter,
            DispatcherConfig {
                sink_url: "http://127.0.0.1:1/events".into(),
                target_slug: "audit-sink".into(),
                service_name: "gateway".into(),
                api_version: 1,
                ndjson: true,
                timeout: Duration::from_secs(1),
            },
        );

        assert_eq!(dispatcher.send(&[]).await, DispatchOutcome::Ok);
    }
}
