//! Webhook ingestion: inbound requests are queued per source type, batched,
//! sent to the source transformer, and answered from its per-request result.
use anyhow::{Context, Result};
use axum::http::{header, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{AdapterVersion, WebhookSettings};
use crate::stats::{tags, Stats, Tags};

pub mod adapter;
pub mod model;

pub use adapter::{adapter_for, SourceTransformAdapter};
pub use model::{
    AuthRequestContext, EnqueueError, Gateway, OutputToSource, TransformerResponse,
    WebhookFailure,
};

pub const OK: &str = "OK";
pub const REQUEST_BODY_TOO_LARGE: &str = "Request size too large";
pub const SOURCE_TRANSFORMER_FAILED: &str = "source Transformer returned non-success status";
pub const SOURCE_TRANSFORMER_INVALID_RESPONSE_FORMAT: &str =
    "Invalid format of source transformer response";
pub const SOURCE_TRANSFORMER_UNREACHABLE: &str = "Internal server error in source transformer";
pub const SOURCE_NOT_REGISTERED: &str = "Source type is not enabled for webhook";
pub const GET_NOT_ALLOWED: &str = "GET method is not allowed for this source";
pub const TOO_MANY_REQUESTS: &str = "Too many requests for this source";
pub const SHUTTING_DOWN: &str = "Webhook transformer is shutting down";
pub const INVALID_REQUEST: &str = "Invalid request";

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const EVENT_TYPE_BATCH: &str = "batch";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
}

impl WebhookResponse {
    pub fn text(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            content_type: TEXT_PLAIN.to_string(),
            body: Bytes::from(message.into()),
        }
    }

    pub fn ok() -> Self {
        Self::text(200, OK)
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl IntoResponse for WebhookResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, [(header::CONTENT_TYPE, self.content_type)], self.body).into_response()
    }
}

struct WebhookRequest {
    auth: AuthRequestContext,
    version: AdapterVersion,
    payload: Vec<u8>,
    reply: oneshot::Sender<WebhookResponse>,
}

struct Inner {
    settings: WebhookSettings,
    gateway: Arc<dyn Gateway>,
    stats: Arc<dyn Stats>,
    http: Client,
    queues: RwLock<HashMap<String, mpsc::Sender<WebhookRequest>>>,
    in_flight: Arc<Semaphore>,
    tracker: TaskTracker,
    closed: CancellationToken,
}

#[derive(Clone)]
pub struct WebhookTransformer {
    inner: Arc<Inner>,
}

impl fmt::Debug for WebhookTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookTransformer")
            .field("transformer_url", &self.inner.settings.transformer_url)
            .field("sources", &self.inner.queues.read().len())
            .field("closed", &self.inner.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Count one `webhook_num_errors` per request; identical tag sets add up.
pub fn record_webhook_errors(
    stats: &dyn Stats,
    source_type: &str,
    reason: &str,
    contexts: &[&AuthRequestContext],
    status_code: u16,
) {
    let status = status_code.to_string();
    let mut counts: HashMap<Tags, u64> = HashMap::new();
    for ctx in contexts {
        let key = tags([
            ("writeKey", ctx.write_key.as_str()),
            ("workspaceId", ctx.workspace_id.as_str()),
            ("sourceID", ctx.source_id.as_str()),
            ("statusCode", status.as_str()),
            ("sourceType", source_type),
            ("reason", reason),
        ]);
        *counts.entry(key).or_insert(0) += 1;
    }
    for (key, count) in counts {
        stats.count("webhook_num_errors", &key, count);
    }
}

fn json_array<'a>(items: impl Iterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut out = vec![b'['];
    for (i, item) in items.enumerate() {
        if i > 0 {
            out.push(b',');
        }
        out.extend_from_slice(item);
    }
    out.push(b']');
    out
}

impl WebhookTransformer {
    pub fn new(
        settings: WebhookSettings,
        gateway: Arc<dyn Gateway>,
        stats: Arc<dyn Stats>,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent("event-relay/0.1")
            .no_proxy()
            .timeout(settings.transformer_timeout)
            .build()
            .context("building source transformer client")?;
        let in_flight = Arc::new(Semaphore::new(settings.max_transformer_process));
        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                gateway,
                stats,
                http,
                queues: RwLock::new(HashMap::new()),
                in_flight,
                tracker: TaskTracker::new(),
                closed: CancellationToken::new(),
            }),
        })
    }

    /// Accept webhooks for `source_type`. Registering twice is a no-op.
    pub fn register(&self, source_type: &str) {
        if self.inner.closed.is_cancelled() {
            warn!(source_type, "register after shutdown ignored");
            return;
        }
        let mut queues = self.inner.queues.write();
        if queues.contains_key(source_type) {
            return;
        }
        let (tx, rx) = mpsc::channel(self.inner.settings.max_pending_requests);
        queues.insert(source_type.to_string(), tx);
        let inner = Arc::clone(&self.inner);
        let source = source_type.to_string();
        self.inner
            .tracker
            .spawn(async move { run_batcher(inner, source, rx).await });
        info!(source_type, "webhook source registered");
    }

    /// Largest adapted payload accepted, in bytes.
    pub fn max_request_bytes(&self) -> usize {
        self.inner.settings.max_req_size_kb.current_value() * 1024
    }

    pub fn is_get_and_not_allowed(&self, method: &Method, source_type: &str) -> bool {
        method == Method::GET
            && !self
                .inner
                .settings
                .forward_get_request_for_srcs
                .current_value()
                .contains(&source_type.to_ascii_lowercase())
    }

    fn reject(&self, auth: &AuthRequestContext, status: u16, reason: &str) -> WebhookResponse {
        record_webhook_errors(
            self.inner.stats.as_ref(),
            &auth.source_def_name,
            reason,
            &[auth],
            status,
        );
        WebhookResponse::text(status, reason)
    }

    #[instrument(skip_all, fields(source_type = %auth.source_def_name))]
    pub async fn request_handler(
        &self,
        auth: AuthRequestContext,
        request: Request<Bytes>,
    ) -> WebhookResponse {
        let inner = &self.inner;
        if inner.closed.is_cancelled() {
            return self.reject(&auth, 503, SHUTTING_DOWN);
        }
        let source_type = auth.source_def_name.clone();
        let queue = inner.queues.read().get(&source_type).cloned();
        let Some(queue) = queue else {
            return self.reject(&auth, 404, SOURCE_NOT_REGISTERED);
        };
        if self.is_get_and_not_allowed(request.method(), &source_type) {
            return self.reject(&auth, 405, GET_NOT_ALLOWED);
        }

        let version = inner
            .settings
            .adapter_versions
            .current_value()
            .get(&source_type.to_ascii_lowercase())
            .copied()
            .unwrap_or_default();
        let parse_params_for = inner.settings.source_list_for_parsing_params.current_value();
        let payload = match adapter_for(version).transformer_event(&request, &source_type, &parse_params_for) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(error = %err, "could not build transformer event");
                return self.reject(&auth, 400, INVALID_REQUEST);
            }
        };
        if payload.len() > self.max_request_bytes() {
            return self.reject(&auth, 413, REQUEST_BODY_TOO_LARGE);
        }

        let (reply, response) = oneshot::channel();
        let queued = queue.try_send(WebhookRequest {
            auth: auth.clone(),
            version,
            payload,
            reply,
        });
        drop(queue);
        match queued {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                return self.reject(&auth, 429, TOO_MANY_REQUESTS)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return self.reject(&auth, 503, SHUTTING_DOWN)
            }
        }

        response
            .await
            .unwrap_or_else(|_| WebhookResponse::text(500, SOURCE_TRANSFORMER_UNREACHABLE))
    }

    /// Stop accepting requests and wait for queued ones to be answered.
    /// Later calls return immediately.
    pub async fn shutdown(&self) {
        if !self.inner.closed.is_cancelled() {
            info!("webhook transformer shutting down");
        }
        self.inner.closed.cancel();
        self.inner.queues.write().clear();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

async fn run_batcher(inner: Arc<Inner>, source_type: String, mut rx: mpsc::Receiver<WebhookRequest>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        let deadline = tokio::time::sleep(inner.settings.batch_timeout);
        tokio::pin!(deadline);
        while batch.len() < inner.settings.max_batch_size {
            tokio::select! {
                next = rx.recv() => match next {
                    Some(req) => batch.push(req),
                    None => break,
                },
                _ = &mut deadline => break,
            }
        }

        let Ok(permit) = Arc::clone(&inner.in_flight).acquire_owned().await else {
            error!(source_type, "transformer pool closed, dropping batch");
            break;
        };
        let worker = Arc::clone(&inner);
        let source = source_type.clone();
        inner.tracker.spawn(async move {
            let _permit = permit;
            worker.process_batch(&source, batch).await;
        });
    }
    debug!(source_type, "webhook batcher stopped");
}

impl Inner {
    async fn process_batch(&self, source_type: &str, batch: Vec<WebhookRequest>) {
        let (v1, v0): (Vec<_>, Vec<_>) = batch
            .into_iter()
            .partition(|r| r.version == AdapterVersion::V1);
        for group in [v0, v1] {
            if !group.is_empty() {
                self.transform_group(source_type, group).await;
            }
        }
    }

    /// POST `body`, retrying transport errors and 5xx answers.
    async fn post_with_retry(&self, url: &str, body: Bytes) -> reqwest::Result<(u16, Bytes)> {
        let max_retry = self.settings.max_retry.current_value();
        let retry_sleep = self.settings.retry_sleep.current_value();
        let mut attempt = 0u32;
        loop {
            let result = async {
                let response = self
                    .http
                    .post(url)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body.clone())
                    .send()
                    .await?;
                let status = response.status().as_u16();
                let bytes = response.bytes().await?;
                Ok::<_, reqwest::Error>((status, bytes))
            }
            .await;

            let retryable = match &result {
                Err(_) => true,
                Ok((status, _)) => *status >= 500,
            };
            if !retryable || attempt >= max_retry {
                return result;
            }
            attempt += 1;
            match &result {
                Err(err) => warn!(url, attempt, error = %err, "source transformer request failed, retrying"),
                Ok((status, _)) => warn!(url, attempt, status, "source transformer answered with server error, retrying"),
            }
            tokio::time::sleep(retry_sleep).await;
        }
    }

    async fn transform_group(&self, source_type: &str, requests: Vec<WebhookRequest>) {
        let version = requests[0].version;
        let url = adapter_for(version).transformer_url(&self.settings.transformer_url, source_type);
        let body = json_array(requests.iter().map(|r| r.payload.as_slice()));

        let started = Instant::now();
        let outcome = self.post_with_retry(&url, Bytes::from(body)).await;
        self.stats.timing(
            "webhook_source_transform_time",
            &tags([("sourceType", source_type)]),
            started.elapsed(),
        );

        let responses = match outcome {
            Err(err) => {
                error!(url = %url, error = %err, "source transformer unreachable");
                return self
                    .fail_all(source_type, requests, 500, SOURCE_TRANSFORMER_UNREACHABLE)
                    .await;
            }
            Ok((status, body)) if status != 200 => {
                error!(url = %url, status, body = %String::from_utf8_lossy(&body), "source transformer returned non-success status");
                return self
                    .fail_all(source_type, requests, 500, SOURCE_TRANSFORMER_FAILED)
                    .await;
            }
            Ok((_, body)) => match serde_json::from_slice::<Vec<TransformerResponse>>(&body) {
                Ok(responses) if responses.len() == requests.len() => responses,
                Ok(responses) => {
                    error!(
                        sent = requests.len(),
                        received = responses.len(),
                        "source transformer response length mismatch"
                    );
                    return self
                        .fail_all(source_type, requests, 500, SOURCE_TRANSFORMER_INVALID_RESPONSE_FORMAT)
                        .await;
                }
                Err(err) => {
                    error!(error = %err, "source transformer response is not a list of results");
                    return self
                        .fail_all(source_type, requests, 500, SOURCE_TRANSFORMER_INVALID_RESPONSE_FORMAT)
                        .await;
                }
            },
        };

        let mut failures = Vec::new();
        for (request, response) in requests.into_iter().zip(responses) {
            let reply = self
                .answer(source_type, &request, response, &mut failures)
                .await;
            // the caller may have gone away
            let _ = request.reply.send(reply);
        }
        self.save_failures(failures).await;
    }

    async fn answer(
        &self,
        source_type: &str,
        request: &WebhookRequest,
        response: TransformerResponse,
        failures: &mut Vec<WebhookFailure>,
    ) -> WebhookResponse {
        if response.status_code != 200 {
            let status = if response.status_code == 0 {
                500
            } else {
                response.status_code
            };
            let reason = if response.err.is_empty() {
                SOURCE_TRANSFORMER_FAILED.to_string()
            } else {
                response.err
            };
            record_webhook_errors(self.stats.as_ref(), source_type, &reason, &[&request.auth], status);
            failures.push(failure(source_type, request, status, &reason));
            return WebhookResponse::text(status, reason);
        }

        if let Some(output) = response.output {
            let payload = Value::Object(output);
            if let Err(err) = self
                .gateway
                .process_transformed_webhook_request(EVENT_TYPE_BATCH, payload, &request.auth)
                .await
            {
                warn!(source_type, error = %err, "enqueueing webhook events failed");
                record_webhook_errors(
                    self.stats.as_ref(),
                    source_type,
                    &err.message,
                    &[&request.auth],
                    err.status,
                );
                return WebhookResponse::text(err.status, err.message);
            }
        }

        match response.output_to_source {
            Some(out) => WebhookResponse {
                status: 200,
                content_type: if out.content_type.is_empty() {
                    TEXT_PLAIN.to_string()
                } else {
                    out.content_type
                },
                body: Bytes::from(out.body),
            },
            None => WebhookResponse::ok(),
        }
    }

    async fn fail_all(
        &self,
        source_type: &str,
        requests: Vec<WebhookRequest>,
        status: u16,
        reason: &str,
    ) {
        let contexts: Vec<&AuthRequestContext> = requests.iter().map(|r| &r.auth).collect();
        record_webhook_errors(self.stats.as_ref(), source_type, reason, &contexts, status);
        let failures = requests
            .iter()
            .map(|r| failure(source_type, r, status, reason))
            .collect();
        for request in requests {
            let _ = request.reply.send(WebhookResponse::text(status, reason));
        }
        self.save_failures(failures).await;
    }

    async fn save_failures(&self, failures: Vec<WebhookFailure>) {
        if failures.is_empty() {
            return;
        }
        let count = failures.len();
        if let Err(err) = self.gateway.save_webhook_failures(failures).await {
            warn!(count, error = %err, "saving webhook failures failed");
        }
    }
}

fn failure(source_type: &str, request: &WebhookRequest, status: u16, reason: &str) -> WebhookFailure {
    WebhookFailure {
        source_type: source_type.to_string(),
        write_key: request.auth.write_key.clone(),
        source_id: request.auth.source_id.clone(),
        workspace_id: request.auth.workspace_id.clone(),
        status_code: status,
        reason: reason.to_string(),
        payload: String::from_utf8_lossy(&request.payload).into_owned(),
        created_at: Utc::now(),
    }
}
