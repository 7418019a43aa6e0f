use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use super::{endpoint_of, MetricLabels, RouterTransformer};
use crate::config::AdapterVersion;
use crate::model::Connection;
use crate::oauth::{AuthErrorCategory, DestinationInfo, InterceptorResponse};
use crate::stats::tags;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyRequestMetadata {
    pub job_id: i64,
    pub attempt_num: u32,
    pub user_id: String,
    pub source_id: String,
    pub destination_id: String,
    pub workspace_id: String,
    pub secret: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub dest_info: Value,
    pub dont_batch: bool,
}

/// The destination call the service should make on our behalf.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PostParameters {
    #[serde(rename = "type")]
    pub kind: String,
    pub endpoint: String,
    #[serde(rename = "endpointPath")]
    pub endpoint_path: String,
    #[serde(rename = "method")]
    pub request_method: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub headers: Map<String, Value>,
    #[serde(rename = "params")]
    pub query_params: Map<String, Value>,
    pub body: Map<String, Value>,
    pub files: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyRequestPayload {
    pub post_parameters: PostParameters,
    pub metadata: Vec<ProxyRequestMetadata>,
    pub destination_config: Map<String, Value>,
}

#[derive(Clone)]
pub struct ProxyRequestParams {
    pub response_data: ProxyRequestPayload,
    pub dest_name: String,
    pub adapter: Arc<dyn ProxyAdapter>,
    pub dest_info: Option<DestinationInfo>,
    pub connection: Connection,
}

/// Outcome of a proxied delivery. Per-job maps are empty when the call
/// never produced a destination answer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyResponse {
    pub status_code: u16,
    pub body: String,
    pub content_type: String,
    pub job_status_codes: HashMap<i64, u16>,
    pub job_bodies: HashMap<i64, String>,
    pub dont_batch: HashMap<i64, bool>,
    pub auth_error_category: Option<AuthErrorCategory>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdapterResponse {
    pub job_status_codes: HashMap<i64, u16>,
    pub job_bodies: HashMap<i64, String>,
    pub dont_batch: HashMap<i64, bool>,
    pub auth_error_category: Option<AuthErrorCategory>,
}

/// Version-specific framing of proxy calls.
pub trait ProxyAdapter: Send + Sync {
    fn payload(&self, params: &ProxyRequestParams) -> Result<Vec<u8>>;

    fn proxy_url(&self, dest_name: &str) -> Result<String>;

    /// Per-job results from the `output` object of the service's answer.
    fn response(
        &self,
        output: &[u8],
        status_code: u16,
        metadata: &[ProxyRequestMetadata],
    ) -> Result<AdapterResponse>;
}

pub fn proxy_adapter(version: AdapterVersion, base_url: &str) -> Arc<dyn ProxyAdapter> {
    let base_url = base_url.trim_end_matches('/').to_string();
    match version {
        AdapterVersion::V0 => Arc::new(ProxyAdapterV0 { base_url }),
        AdapterVersion::V1 => Arc::new(ProxyAdapterV1 { base_url }),
    }
}

fn proxy_url(base_url: &str, version: &str, dest_name: &str) -> Result<String> {
    if dest_name.trim().is_empty() {
        return Err(anyhow!("destination name is empty"));
    }
    let raw = format!(
        "{base_url}/{version}/destinations/{}/proxy",
        dest_name.to_ascii_lowercase()
    );
    url::Url::parse(&raw).with_context(|| format!("invalid proxy url {raw}"))?;
    Ok(raw)
}

/// Carries only the first job's metadata; every job shares the outcome.
#[derive(Debug, Clone)]
pub struct ProxyAdapterV0 {
    base_url: String,
}

#[derive(Serialize)]
struct PayloadV0<'a> {
    #[serde(flatten)]
    post_parameters: &'a PostParameters,
    metadata: &'a ProxyRequestMetadata,
    #[serde(rename = "destinationConfig")]
    destination_config: &'a Map<String, Value>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct OutputCategory {
    #[serde(rename = "authErrorCategory")]
    auth_error_category: String,
}

impl ProxyAdapter for ProxyAdapterV0 {
    fn payload(&self, params: &ProxyRequestParams) -> Result<Vec<u8>> {
        let data = &params.response_data;
        let metadata = data
            .metadata
            .first()
            .ok_or_else(|| anyhow!("no metadata to proxy"))?;
        serde_json::to_vec(&PayloadV0 {
            post_parameters: &data.post_parameters,
            metadata,
            destination_config: &data.destination_config,
        })
        .context("marshalling v0 proxy payload")
    }

    fn proxy_url(&self, dest_name: &str) -> Result<String> {
        proxy_url(&self.base_url, "v0", dest_name)
    }

    fn response(
        &self,
        output: &[u8],
        status_code: u16,
        metadata: &[ProxyRequestMetadata],
    ) -> Result<AdapterResponse> {
        let body = String::from_utf8_lossy(output).into_owned();
        let mut response = AdapterResponse::default();
        for m in metadata {
            response.job_status_codes.insert(m.job_id, status_code);
            response.job_bodies.insert(m.job_id, body.clone());
            response.dont_batch.insert(m.job_id, m.dont_batch);
        }
        response.auth_error_category = serde_json::from_slice::<OutputCategory>(output)
            .ok()
            .and_then(|o| AuthErrorCategory::parse(&o.auth_error_category));
        Ok(response)
    }
}

/// Carries every job's metadata and the connection; the service answers
/// per job.
#[derive(Debug, Clone)]
pub struct ProxyAdapterV1 {
    base_url: String,
}

#[derive(Serialize)]
struct PayloadV1<'a> {
    #[serde(flatten)]
    post_parameters: &'a PostParameters,
    metadata: &'a [ProxyRequestMetadata],
    #[serde(rename = "destinationConfig")]
    destination_config: &'a Map<String, Value>,
    connection: &'a Connection,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct JobResponseV1 {
    #[serde(rename = "statusCode")]
    status_code: u16,
    metadata: ProxyRequestMetadata,
    error: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct OutputV1 {
    response: Vec<JobResponseV1>,
    #[serde(rename = "authErrorCategory")]
    auth_error_category: String,
}

impl ProxyAdapter for ProxyAdapterV1 {
    fn payload(&self, params: &ProxyRequestParams) -> Result<Vec<u8>> {
        let data = &params.response_data;
        serde_json::to_vec(&PayloadV1 {
            post_parameters: &data.post_parameters,
            metadata: &data.metadata,
            destination_config: &data.destination_config,
            connection: &params.connection,
        })
        .context("marshalling v1 proxy payload")
    }

    fn proxy_url(&self, dest_name: &str) -> Result<String> {
        proxy_url(&self.base_url, "v1", dest_name)
    }

    fn response(
        &self,
        output: &[u8],
        _status_code: u16,
        metadata: &[ProxyRequestMetadata],
    ) -> Result<AdapterResponse> {
        let parsed: OutputV1 =
            serde_json::from_slice(output).context("unmarshalling v1 proxy response")?;
        let mut response = AdapterResponse::default();
        for job in parsed.response {
            let id = job.metadata.job_id;
            response.job_status_codes.insert(id, job.status_code);
            response.job_bodies.insert(id, job.error);
            response.dont_batch.insert(id, job.metadata.dont_batch);
        }
        if let Some(missing) = metadata
            .iter()
            .find(|m| !response.job_status_codes.contains_key(&m.job_id))
        {
            return Err(anyhow!("response for job {} not found", missing.job_id));
        }
        response.auth_error_category = AuthErrorCategory::parse(&parsed.auth_error_category);
        Ok(response)
    }
}

struct ProxyOutcome {
    status_code: u16,
    body: bytes::Bytes,
    interceptor: Option<InterceptorResponse>,
}

/// Raw JSON of the `output` field, empty when absent.
fn output_field(body: &[u8]) -> Vec<u8> {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|mut v| v.get_mut("output").map(Value::take))
        .and_then(|output| serde_json::to_vec(&output).ok())
        .unwrap_or_default()
}

impl RouterTransformer {
    /// Deliver one prepared request through the service's proxy endpoint.
    #[instrument(skip_all, fields(dest = %params.dest_name))]
    pub async fn proxy_request(
        &self,
        cancel: &CancellationToken,
        params: &ProxyRequestParams,
    ) -> ProxyResponse {
        let start = Instant::now();
        let metadata = &params.response_data.metadata;
        let failure = |status_code: u16, body: String, dont_batch: HashMap<i64, bool>| ProxyResponse {
            status_code,
            body,
            content_type: TEXT_PLAIN.to_string(),
            dont_batch,
            ..Default::default()
        };

        let Some(first) = metadata.first() else {
            warn!(dest = %params.dest_name, "input metadata is empty");
            return failure(400, "Input metadata is empty".into(), HashMap::new());
        };
        let dont_batch: HashMap<i64, bool> =
            metadata.iter().map(|m| (m.job_id, m.dont_batch)).collect();

        let payload = match params.adapter.payload(params) {
            Ok(payload) => payload,
            Err(err) => {
                error!(dest = %params.dest_name, error = %err, "payload preparation failed");
                return failure(500, "Payload preparation failed".into(), dont_batch);
            }
        };
        let url = match params.adapter.proxy_url(&params.dest_name) {
            Ok(url) => url,
            Err(err) => {
                error!(dest = %params.dest_name, error = %err, "proxy url preparation failed");
                return failure(500, "ProxyURL preparation failed".into(), dont_batch);
            }
        };

        let endpoint = endpoint_of(&url);
        let labels = MetricLabels {
            endpoint: &endpoint,
            destination_type: &params.dest_name,
            stage: "router_proxy",
            workspace_id: &first.workspace_id,
            destination_id: &first.destination_id,
            ..Default::default()
        }
        .to_tags();
        self.stats
            .increment("transformer_proxy_delivery_request", &labels);
        self.stats
            .count("transformer_client_request_total_bytes", &labels, payload.len() as u64);

        let call_start = Instant::now();
        let outcome = self.do_proxy_request(cancel, &url, params, payload).await;
        let elapsed = call_start.elapsed();

        let response_len = outcome.as_ref().map(|o| o.body.len()).unwrap_or(0);
        self.stats
            .count("transformer_client_total_durations_seconds", &labels, elapsed.as_secs());
        self.stats
            .count("transformer_client_response_total_bytes", &labels, response_len as u64);
        let mut with_success = labels.clone();
        with_success.insert("requestSuccess".into(), outcome.is_ok().to_string());
        self.stats
            .timing("transformer_proxy_request_latency", &with_success, elapsed);
        self.stats
            .increment("transformer_proxy_request_result", &with_success);

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err((status_code, message)) => return failure(status_code, message, dont_batch),
        };

        let interceptor = if self.proxy_transport.oauth_active() {
            outcome.interceptor.filter(|i| !i.is_empty())
        } else {
            None
        };
        let mut status_code = outcome.status_code;
        if let Some(i) = &interceptor {
            if i.status_code > 0 {
                status_code = i.status_code;
            }
        }

        let output = output_field(&outcome.body);
        let mut response = match params.adapter.response(&output, status_code, metadata) {
            Ok(response) => response,
            Err(err) => return failure(status_code, format!("{err:#}"), dont_batch),
        };

        let mut body = String::from_utf8_lossy(&output).into_owned();
        if let Some(i) = &interceptor {
            for m in metadata {
                if i.status_code > 0 {
                    response.job_status_codes.insert(m.job_id, i.status_code);
                }
                if !i.response.is_empty() {
                    response.job_bodies.insert(m.job_id, i.response.clone());
                }
            }
            if !i.response.is_empty() {
                body = i.response.clone();
            }
        }

        self.stats
            .count("transformer_client_request_total_events", &labels, metadata.len() as u64);
        self.stats.count(
            "transformer_client_response_total_events",
            &labels,
            response.job_status_codes.len() as u64,
        );
        self.stats
            .timing("transformer_client_total_time", &labels, start.elapsed());

        ProxyResponse {
            status_code,
            body,
            content_type: "application/json".to_string(),
            job_status_codes: response.job_status_codes,
            job_bodies: response.job_bodies,
            dont_batch: response.dont_batch,
            auth_error_category: response.auth_error_category,
        }
    }

    async fn do_proxy_request(
        &self,
        cancel: &CancellationToken,
        url: &str,
        params: &ProxyRequestParams,
        payload: Vec<u8>,
    ) -> std::result::Result<ProxyOutcome, (u16, String)> {
        let request = self
            .proxy_transport
            .plain
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(
                "RdProxy-Timeout",
                self.settings.destination_timeout.as_millis().to_string(),
            )
            .body(payload)
            .build()
            .map_err(|err| {
                error!(dest = %params.dest_name, error = %err, "building proxy request failed");
                (500, err.to_string())
            })?;
        debug!(
            dest = %params.dest_name,
            timeout_ms = (self.settings.destination_timeout + self.settings.timeout).as_millis() as u64,
            "proxying request"
        );

        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(dest = %params.dest_name, "proxy request cancelled");
                return Err((500, "request cancelled".to_string()));
            }
            result = self.proxy_transport.send(request, params.dest_info.as_ref()) => result,
        };
        self.stats.timing(
            "transformer_proxy_req_round_trip_time",
            &tags([("destType", params.dest_name.as_str())]),
            started.elapsed(),
        );

        match result {
            Err(err) if err.is_timeout() => {
                error!(dest = %params.dest_name, error = %err, "proxy request timed out");
                Err((504, err.to_string()))
            }
            Err(err) => {
                error!(dest = %params.dest_name, error = %err, "proxy request failed");
                Err((500, err.to_string()))
            }
            Ok(response) if response.status == 404 => {
                let message = format!("post \"{url}\" not found");
                error!(dest = %params.dest_name, "{message}");
                Err((500, message))
            }
            Ok(response) if response.body.is_empty() => {
                error!(dest = %params.dest_name, "empty response body");
                Err((500, "empty response body".to_string()))
            }
            Ok(response) => Ok(ProxyOutcome {
                status_code: response.status,
                body: response.body,
                interceptor: response.interceptor,
            }),
        }
    }
}
