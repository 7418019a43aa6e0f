//! OAuth-aware HTTP client for calls made on behalf of a destination.
//!
//! Credentials are cached per destination and guarded by a
//! [`PartitionLocker`] so that at most one refresh runs per credential while
//! unrelated destinations proceed in parallel. When a response reports an
//! auth error the client repairs the credential and attaches an
//! [`InterceptorResponse`] telling the caller how to report the jobs.
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Request};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Reloadable;
use crate::model::Destination;

pub mod lock;

pub use lock::PartitionLocker;

pub const DEST_INFO_HEADER: &str = "x-rudder-dest-info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthErrorCategory {
    RefreshToken,
    AuthStatusInactive,
}

impl AuthErrorCategory {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REFRESH_TOKEN" => Some(Self::RefreshToken),
            "AUTH_STATUS_INACTIVE" => Some(Self::AuthStatusInactive),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RefreshToken => "REFRESH_TOKEN",
            Self::AuthStatusInactive => "AUTH_STATUS_INACTIVE",
        }
    }
}

impl fmt::Display for AuthErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn is_valid_auth_error_category(s: &str) -> bool {
    AuthErrorCategory::parse(s).is_some()
}

/// The destination a call is made for.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DestinationInfo {
    pub workspace_id: String,
    pub definition_name: String,
    pub id: String,
    pub config: Map<String, Value>,
    pub definition_config: Map<String, Value>,
}

impl DestinationInfo {
    pub fn new(workspace_id: &str, destination: &Destination) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            definition_name: destination.destination_definition.name.clone(),
            id: destination.id.clone(),
            config: destination.config.clone(),
            definition_config: destination.destination_definition.config.clone(),
        }
    }

    pub fn is_oauth(&self) -> bool {
        self.definition_config
            .get("auth")
            .and_then(|auth| auth.get("type"))
            .and_then(Value::as_str)
            == Some("OAuth")
    }

    /// Credential identity.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.workspace_id, self.definition_name, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    pub secret: Value,
    #[serde(default)]
    pub expiration_date: Option<DateTime<Utc>>,
}

impl AccessToken {
    fn expires_within(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let Some(expiration) = self.expiration_date else {
            return false;
        };
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero());
        expiration - margin <= now
    }
}

/// Where credentials live. Implemented outside this crate.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn fetch(&self, destination: &DestinationInfo) -> Result<AccessToken>;

    /// Exchange `stale` for a fresh token.
    async fn refresh(&self, destination: &DestinationInfo, stale: &AccessToken)
        -> Result<AccessToken>;

    /// Mark the destination's authorization as inactive.
    async fn invalidate(&self, destination: &DestinationInfo) -> Result<()>;
}

/// Status/body the caller must report instead of the destination's answer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct InterceptorResponse {
    pub status_code: u16,
    pub response: String,
}

impl InterceptorResponse {
    pub fn is_empty(&self) -> bool {
        self.status_code == 0 && self.response.is_empty()
    }
}

/// A completed outbound call. `body` is always the service's own answer.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub interceptor: Option<InterceptorResponse>,
}

/// Execute without any credential handling.
pub async fn send_plain(client: &Client, request: Request) -> reqwest::Result<TransportResponse> {
    let response = client.execute(request).await?;
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let body = response.bytes().await?;
    Ok(TransportResponse {
        status,
        headers,
        body,
        interceptor: None,
    })
}

/// Finds the auth error category in a response body.
pub type CategoryExtractor = fn(&[u8]) -> Result<Option<AuthErrorCategory>>;

#[derive(Deserialize)]
struct CategoryHolder {
    #[serde(rename = "authErrorCategory", default)]
    auth_error_category: String,
}

#[derive(Deserialize)]
struct TransformOutput {
    output: Vec<CategoryHolder>,
}

#[derive(Deserialize)]
struct ProxyOutput {
    output: CategoryHolder,
}

/// First recognised category among the `output` records of a transform
/// response.
pub fn category_from_transform_response(body: &[u8]) -> Result<Option<AuthErrorCategory>> {
    let parsed: TransformOutput =
        serde_json::from_slice(body).context("transform response has no output array")?;
    Ok(parsed
        .output
        .iter()
        .find_map(|job| AuthErrorCategory::parse(&job.auth_error_category)))
}

/// Category of a proxy response's `output` object.
pub fn category_from_proxy_response(body: &[u8]) -> Result<Option<AuthErrorCategory>> {
    let parsed: ProxyOutput =
        serde_json::from_slice(body).context("proxy response has no output object")?;
    Ok(AuthErrorCategory::parse(&parsed.output.auth_error_category))
}

const INACTIVE_MESSAGE: &str =
    "problem with user permission or access/refresh token have been revoked";

/// Token cache shared by every client of one router.
#[derive(Clone, Default)]
pub struct TokenCache {
    tokens: Arc<Mutex<HashMap<String, AccessToken>>>,
    locker: PartitionLocker,
}

impl fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("tokens", &self.tokens.lock().len())
            .finish_non_exhaustive()
    }
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<AccessToken> {
        self.tokens.lock().get(key).cloned()
    }

    fn put(&self, key: &str, token: AccessToken) {
        self.tokens.lock().insert(key.to_string(), token);
    }

    fn evict(&self, key: &str) {
        self.tokens.lock().remove(key);
    }
}

#[derive(Clone)]
pub struct OAuthHttpClient {
    http: Client,
    store: Arc<dyn CredentialStore>,
    cache: TokenCache,
    expiration_time_diff: Reloadable<Duration>,
    extract_category: CategoryExtractor,
}

impl fmt::Debug for OAuthHttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthHttpClient")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl OAuthHttpClient {
    pub fn new(
        http: Client,
        store: Arc<dyn CredentialStore>,
        cache: TokenCache,
        expiration_time_diff: Reloadable<Duration>,
        extract_category: CategoryExtractor,
    ) -> Self {
        Self {
            http,
            store,
            cache,
            expiration_time_diff,
            extract_category,
        }
    }

    /// Send `request` for `destination`. Non-OAuth destinations go out
    /// untouched.
    pub async fn execute(
        &self,
        mut request: Request,
        destination: &DestinationInfo,
    ) -> reqwest::Result<TransportResponse> {
        if !destination.is_oauth() {
            return send_plain(&self.http, request).await;
        }

        let key = destination.key();
        let token = match self.token(&key, destination).await {
            Ok(token) => token,
            Err(err) => {
                warn!(destination_id = %destination.id, error = %err, "fetching token failed");
                let message = format!("error fetching token: {err:#}");
                return Ok(TransportResponse {
                    status: 500,
                    headers: HeaderMap::new(),
                    body: Bytes::from(message.clone()),
                    interceptor: Some(InterceptorResponse {
                        status_code: 500,
                        response: message,
                    }),
                });
            }
        };

        let dest_info = json!({ "secret": token.secret }).to_string();
        if let Ok(value) = HeaderValue::from_str(&dest_info) {
            request.headers_mut().insert(DEST_INFO_HEADER, value);
        }

        let mut response = send_plain(&self.http, request).await?;
        let category = match (self.extract_category)(&response.body) {
            Ok(category) => category,
            Err(err) => {
                debug!(error = %err, "no auth error category in response");
                None
            }
        };
        response.interceptor = match category {
            Some(AuthErrorCategory::RefreshToken) => {
                Some(self.refresh(&key, destination, &token).await)
            }
            Some(AuthErrorCategory::AuthStatusInactive) => {
                Some(self.deactivate(&key, destination).await)
            }
            None => None,
        };
        Ok(response)
    }

    async fn token(&self, key: &str, destination: &DestinationInfo) -> Result<AccessToken> {
        let margin = self.expiration_time_diff.current_value();
        {
            let _read = self.cache.locker.read(key).await;
            if let Some(token) = self.cache.get(key) {
                if !token.expires_within(Utc::now(), margin) {
                    return Ok(token);
                }
            }
        }

        let _write = self.cache.locker.write(key).await;
        if let Some(token) = self.cache.get(key) {
            if !token.expires_within(Utc::now(), margin) {
                return Ok(token);
            }
        }
        let token = self
            .store
            .fetch(destination)
            .await
            .with_context(|| format!("fetching token for destination {}", destination.id))?;
        self.cache.put(key, token.clone());
        Ok(token)
    }

    async fn refresh(
        &self,
        key: &str,
        destination: &DestinationInfo,
        stale: &AccessToken,
    ) -> InterceptorResponse {
        let _write = self.cache.locker.write(key).await;
        // another caller may have refreshed while we waited
        if let Some(current) = self.cache.get(key) {
            if &current != stale {
                return InterceptorResponse {
                    status_code: 500,
                    response: String::new(),
                };
            }
        }
        match self.store.refresh(destination, stale).await {
            Ok(token) => {
                self.cache.put(key, token);
                InterceptorResponse {
                    status_code: 500,
                    response: String::new(),
                }
            }
            Err(err) => {
                warn!(destination_id = %destination.id, error = %err, "refreshing token failed");
                self.cache.evict(key);
                InterceptorResponse {
                    status_code: 500,
                    response: format!("error refreshing token: {err:#}"),
                }
            }
        }
    }

    async fn deactivate(&self, key: &str, destination: &DestinationInfo) -> InterceptorResponse {
        let _write = self.cache.locker.write(key).await;
        self.cache.evict(key);
        if let Err(err) = self.store.invalidate(destination).await {
            warn!(destination_id = %destination.id, error = %err, "marking auth status inactive failed");
            return InterceptorResponse {
                status_code: 500,
                response: format!("error marking auth status inactive: {err:#}"),
            };
        }
        InterceptorResponse {
            status_code: 400,
            response: INACTIVE_MESSAGE.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn categories_parse() {
        assert!(is_valid_auth_error_category("REFRESH_TOKEN"));
        assert!(is_valid_auth_error_category("AUTH_STATUS_INACTIVE"));
        assert!(!is_valid_auth_error_category(""));
        assert!(!is_valid_auth_error_category("refresh_token"));
        assert_eq!(AuthErrorCategory::RefreshToken.to_string(), "REFRESH_TOKEN");
    }

    #[test]
    fn oauth_detection_reads_definition_config() {
        let mut info = DestinationInfo::default();
        assert!(!info.is_oauth());
        info.definition_config
            .insert("auth".into(), json!({ "type": "OAuth" }));
        assert!(info.is_oauth());
        info.definition_config
            .insert("auth".into(), json!({ "type": "basic" }));
        assert!(!info.is_oauth());
    }

    #[test]
    fn transform_category_is_first_valid_one() {
        let body = br#"{"output":[{"statusCode":200},{"statusCode":401,"authErrorCategory":"AUTH_STATUS_INACTIVE"},{"authErrorCategory":"REFRESH_TOKEN"}]}"#;
        assert_eq!(
            category_from_transform_response(body).unwrap(),
            Some(AuthErrorCategory::AuthStatusInactive)
        );
        assert_eq!(
            category_from_transform_response(br#"{"output":[{"statusCode":200}]}"#).unwrap(),
            None
        );
        assert!(category_from_transform_response(b"not json").is_err());
    }

    #[test]
    fn proxy_category_comes_from_output_object() {
        let body = br#"{"output":{"status":401,"authErrorCategory":"REFRESH_TOKEN"}}"#;
        assert_eq!(
            category_from_proxy_response(body).unwrap(),
            Some(AuthErrorCategory::RefreshToken)
        );
        assert_eq!(
            category_from_proxy_response(br#"{"output":{"status":200}}"#).unwrap(),
            None
        );
    }

    #[test]
    fn token_expiry_honours_margin() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let token = AccessToken {
            secret: json!({ "access_token": "a" }),
            expiration_date: Some(now + chrono::Duration::seconds(30)),
        };
        assert!(token.expires_within(now, Duration::from_secs(60)));
        assert!(!token.expires_within(now, Duration::from_secs(10)));

        let forever = AccessToken {
            secret: Value::Null,
            expiration_date: None,
        };
        assert!(!forever.expires_within(now, Duration::from_secs(60)));
    }

    #[test]
    fn interceptor_emptiness() {
        assert!(InterceptorResponse::default().is_empty());
        assert!(!InterceptorResponse {
            status_code: 500,
            response: String::new()
        }
        .is_empty());
    }
}
