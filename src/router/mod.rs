//! Router-side client of the transformation service: batch/router
//! transforms and proxied delivery.
use anyhow::{Context, Result};
use reqwest::{Client, Request};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{Reloadable, TransformerSettings};
use crate::features::FeaturesService;
use crate::oauth::{
    self, CategoryExtractor, CredentialStore, DestinationInfo, OAuthHttpClient, TokenCache,
    TransportResponse,
};
use crate::stats::{Stats, Tags};

pub mod proxy;
pub mod transformer;

pub use proxy::{
    proxy_adapter, AdapterResponse, PostParameters, ProxyAdapter, ProxyAdapterV0, ProxyAdapterV1,
    ProxyRequestMetadata, ProxyRequestParams, ProxyRequestPayload, ProxyResponse,
};
pub use transformer::TransformKind;

/// API version this router speaks; the service announces its own in the
/// `apiVersion` response header.
pub const SUPPORTED_API_VERSION: u32 = 2;
pub const API_VERSION_HEADER: &str = "apiVersion";

/// Conditions the router cannot recover from. Callers must stop the process.
#[derive(Debug, Error)]
pub enum TransformerError {
    #[error("transformer unreachable at {url} after {attempts} attempts: {source}")]
    Connectivity {
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("incompatible transformer version: expected {expected}, received {received}, url {url}")]
    IncompatibleVersion {
        expected: u32,
        received: u32,
        url: String,
    },
    #[error("failed to marshal transform request: {0}")]
    Marshal(#[from] serde_json::Error),
    #[error("failed to build request for {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Plain client plus an optional OAuth wrapper, switched by a live flag.
#[derive(Clone)]
struct Transport {
    plain: Client,
    oauth: Option<OAuthHttpClient>,
    oauth_enabled: Reloadable<bool>,
}

impl Transport {
    fn new(
        plain: Client,
        store: Option<&Arc<dyn CredentialStore>>,
        cache: &TokenCache,
        settings: &TransformerSettings,
        extract: CategoryExtractor,
    ) -> Self {
        let oauth = store.map(|store| {
            OAuthHttpClient::new(
                plain.clone(),
                Arc::clone(store),
                cache.clone(),
                settings.oauth_expiration_time_diff.clone(),
                extract,
            )
        });
        Self {
            plain,
            oauth,
            oauth_enabled: settings.oauth_v2_enabled.clone(),
        }
    }

    fn oauth_active(&self) -> bool {
        self.oauth.is_some() && self.oauth_enabled.current_value()
    }

    async fn send(
        &self,
        request: Request,
        destination: Option<&DestinationInfo>,
    ) -> reqwest::Result<TransportResponse> {
        match (&self.oauth, destination) {
            (Some(client), Some(destination)) if self.oauth_enabled.current_value() => {
                client.execute(request, destination).await
            }
            _ => oauth::send_plain(&self.plain, request).await,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct MetricLabels<'a> {
    pub endpoint: &'a str,
    pub destination_type: &'a str,
    pub source_type: &'a str,
    pub stage: &'a str,
    pub workspace_id: &'a str,
    pub destination_id: &'a str,
    pub source_id: &'a str,
}

impl MetricLabels<'_> {
    pub fn to_tags(&self) -> Tags {
        let mut tags = Tags::new();
        tags.insert("endpoint".into(), self.endpoint.into());
        tags.insert("destinationType".into(), self.destination_type.into());
        tags.insert("sourceType".into(), self.source_type.into());
        tags.insert("stage".into(), self.stage.into());
        tags.insert("workspaceId".into(), self.workspace_id.into());
        tags.insert("destinationId".into(), self.destination_id.into());
        tags.insert("sourceId".into(), self.source_id.into());
        // legacy name
        tags.insert("destType".into(), self.destination_type.into());
        tags
    }
}

/// Host part of `url`, empty when it does not parse.
pub(crate) fn endpoint_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.host_str().map(|host| match u.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            })
        })
        .unwrap_or_default()
}

pub struct RouterTransformer {
    settings: TransformerSettings,
    transform_transport: Transport,
    proxy_transport: Transport,
    features: Arc<dyn FeaturesService>,
    stats: Arc<dyn Stats>,
}

impl fmt::Debug for RouterTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterTransformer")
            .field("url", &self.settings.url)
            .field("oauth", &self.transform_transport.oauth_active())
            .finish_non_exhaustive()
    }
}

impl RouterTransformer {
    /// Build both HTTP clients. With no credential store the OAuth flag is
    /// ignored.
    pub fn new(
        settings: TransformerSettings,
        credentials: Option<Arc<dyn CredentialStore>>,
        features: Arc<dyn FeaturesService>,
        stats: Arc<dyn Stats>,
    ) -> Result<Self> {
        let transform_http = Client::builder()
            .user_agent("event-relay/0.1")
            .no_proxy()
            .timeout(settings.timeout)
            .build()
            .context("building transform client")?;
        let proxy_http = Client::builder()
            .user_agent("event-relay/0.1")
            .no_proxy()
            .timeout(settings.destination_timeout + settings.timeout)
            .build()
            .context("building proxy client")?;

        let cache = TokenCache::new();
        let transform_transport = Transport::new(
            transform_http,
            credentials.as_ref(),
            &cache,
            &settings,
            oauth::category_from_transform_response,
        );
        let proxy_transport = Transport::new(
            proxy_http,
            credentials.as_ref(),
            &cache,
            &settings,
            oauth::category_from_proxy_response,
        );
        Ok(Self {
            settings,
            transform_transport,
            proxy_transport,
            features,
            stats,
        })
    }

    fn compact_request_payloads(&self) -> bool {
        self.settings.compaction_enabled.current_value()
            && self.features.supports_compacted_payload()
    }

    fn batch_url(&self) -> String {
        format!("{}/batch", self.settings.url)
    }

    fn router_transform_url(&self) -> String {
        format!("{}/routerTransform", self.settings.url)
    }
}
