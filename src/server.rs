//! HTTP front door for webhook sources.
use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::Engine;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::SourceEntry;
use crate::webhook::{AuthRequestContext, WebhookTransformer, REQUEST_BODY_TOO_LARGE};

pub const WEBHOOK_PATH: &str = "/v1/webhook";
const WRITE_KEY_PARAM: &str = "writeKey";
/// The size cap applies to the adapted payload, which can be much smaller
/// than the raw body. The raw read only guards against unbounded uploads.
const RAW_BODY_HEADROOM: usize = 4;

/// Maps a write key to the source it belongs to.
pub trait SourceResolver: Send + Sync {
    fn resolve(&self, write_key: &str) -> Option<AuthRequestContext>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticSources {
    by_write_key: HashMap<String, AuthRequestContext>,
}

impl StaticSources {
    pub fn from_config(entries: &[SourceEntry]) -> Self {
        let by_write_key = entries
            .iter()
            .map(|e| {
                (
                    e.write_key.clone(),
                    AuthRequestContext {
                        write_key: e.write_key.clone(),
                        source_id: e.source_id.clone(),
                        source_def_name: e.source_def_name.clone(),
                        workspace_id: e.workspace_id.clone(),
                        source_category: e.source_category.clone(),
                    },
                )
            })
            .collect();
        Self { by_write_key }
    }

    /// Distinct source types, for registering with the webhook transformer.
    pub fn source_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .by_write_key
            .values()
            .map(|c| c.source_def_name.clone())
            .collect();
        types.sort();
        types.dedup();
        types
    }
}

impl SourceResolver for StaticSources {
    fn resolve(&self, write_key: &str) -> Option<AuthRequestContext> {
        self.by_write_key.get(write_key).cloned()
    }
}

#[derive(Clone)]
struct AppState {
    webhook: WebhookTransformer,
    sources: Arc<dyn SourceResolver>,
}

pub fn router(webhook: WebhookTransformer, sources: Arc<dyn SourceResolver>) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, get(handle_webhook).post(handle_webhook))
        .route("/health", get(|| async { "OK" }))
        .with_state(AppState { webhook, sources })
}

/// Write key from `?writeKey=` or the basic-auth user name.
fn write_key(request: &Request<Body>) -> Option<String> {
    if let Some(query) = request.uri().query() {
        if let Some((_, v)) = url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == WRITE_KEY_PARAM)
        {
            return Some(v.into_owned());
        }
    }
    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let user = decoded.split(':').next().unwrap_or_default();
    (!user.is_empty()).then(|| user.to_string())
}

async fn handle_webhook(State(state): State<AppState>, request: Request<Body>) -> Response {
    let Some(auth) = write_key(&request).and_then(|k| state.sources.resolve(&k)) else {
        return (StatusCode::UNAUTHORIZED, "Invalid write key").into_response();
    };

    let (parts, body) = request.into_parts();
    let limit = state.webhook.max_request_bytes().saturating_mul(RAW_BODY_HEADROOM);
    let body = match to_bytes(body, limit).await {
        Ok(body) => body,
        Err(err) => {
            debug!(error = %err, "webhook body rejected");
            return (StatusCode::PAYLOAD_TOO_LARGE, REQUEST_BODY_TOO_LARGE).into_response();
        }
    };

    state
        .webhook
        .request_handler(auth, Request::from_parts(parts, body))
        .await
        .into_response()
}
