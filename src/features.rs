//! Capabilities advertised by the transformation service.
use anyhow::{Context, Result};
use parking_lot::RwLock;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub trait FeaturesService: Send + Sync {
    fn supports_compacted_payload(&self) -> bool;
}

/// Fixed answers, for tests and for running without a features endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticFeatures {
    pub compacted_payload: bool,
}

impl FeaturesService for StaticFeatures {
    fn supports_compacted_payload(&self) -> bool {
        self.compacted_payload
    }
}

#[derive(Debug, Default)]
struct Features {
    compacted_payload: bool,
}

/// Polls `{url}/features` until cancelled. Answers `false` for everything
/// until the first successful fetch.
#[derive(Debug)]
pub struct HttpFeaturesService {
    http: Client,
    url: String,
    features: RwLock<Features>,
    ready: watch::Sender<bool>,
}

impl HttpFeaturesService {
    pub fn new(http: Client, base_url: &str) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            http,
            url: format!("{}/features", base_url.trim_end_matches('/')),
            features: RwLock::new(Features::default()),
            ready,
        }
    }

    /// Start polling on the current runtime.
    pub fn spawn(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(err) = service.fetch_once().await {
                    warn!(url = %service.url, error = %err, "fetching transformer features failed");
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!("transformer features polling stopped");
        });
    }

    pub async fn fetch_once(&self) -> Result<()> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .context("requesting features")?
            .error_for_status()
            .context("features endpoint answered with an error")?;
        let body: Value = response.json().await.context("decoding features")?;
        let compacted = body
            .get("supportDestTransformCompactedPayloadV1")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.features.write().compacted_payload = compacted;
        self.ready.send_replace(true);
        Ok(())
    }

    /// Resolves once features have been fetched at least once.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        // sender lives in self, so this only fails if self is gone
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

impl FeaturesService for HttpFeaturesService {
    fn supports_compacted_payload(&self) -> bool {
        self.features.read().compacted_payload
    }
}
