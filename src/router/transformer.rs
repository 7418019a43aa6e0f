use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

use super::{
    endpoint_of, MetricLabels, RouterTransformer, TransformerError, API_VERSION_HEADER,
    SUPPORTED_API_VERSION,
};
use crate::model::{DestinationJob, TransformMessage};
use crate::oauth::{is_valid_auth_error_category, DestinationInfo, InterceptorResponse};
use crate::stats::{tags, Tags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    /// Many jobs folded into few requests.
    Batch,
    /// One delivery record per job.
    RouterTransform,
}

impl TransformKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransformKind::Batch => "BATCH",
            TransformKind::RouterTransform => "ROUTER_TRANSFORM",
        }
    }
}

impl FromStr for TransformKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BATCH" => Ok(TransformKind::Batch),
            "ROUTER_TRANSFORM" => Ok(TransformKind::RouterTransform),
            other => Err(format!("unknown transform kind {other}")),
        }
    }
}

#[derive(Deserialize)]
struct RouterTransformResponse {
    output: Vec<DestinationJob>,
}

fn parse_response(
    kind: TransformKind,
    body: &[u8],
) -> Result<Vec<DestinationJob>, serde_json::Error> {
    match kind {
        TransformKind::Batch => serde_json::from_slice(body),
        TransformKind::RouterTransform => {
            serde_json::from_slice::<RouterTransformResponse>(body).map(|r| r.output)
        }
    }
}

/// Reason and message when `jobs` does not account for exactly the jobs in
/// `input`.
fn job_id_violation(input: &HashSet<i64>, jobs: &[DestinationJob]) -> Option<(&'static str, String)> {
    let mut counts: HashMap<i64, usize> = HashMap::new();
    for id in jobs.iter().flat_map(|j| j.job_ids()) {
        *counts.entry(id).or_default() += 1;
    }
    let total: usize = counts.values().sum();
    if total != input.len() {
        return Some((
            "in out mismatch",
            format!(
                "Transformer returned invalid output size: {} for input size: {}",
                total,
                input.len()
            ),
        ));
    }
    let mut invalid: Vec<i64> = counts.keys().copied().filter(|id| !input.contains(id)).collect();
    if !invalid.is_empty() {
        invalid.sort_unstable();
        return Some((
            "invalid jobIDs",
            format!("Transformer returned invalid jobIDs: {invalid:?}"),
        ));
    }
    // every input id exactly once
    let mut unbalanced: Vec<i64> = input
        .iter()
        .copied()
        .filter(|id| counts.get(id).copied().unwrap_or(0) != 1)
        .collect();
    if unbalanced.is_empty() {
        return None;
    }
    unbalanced.sort_unstable();
    Some((
        "in out mismatch",
        format!("Transformer returned duplicate or missing jobIDs: {unbalanced:?}"),
    ))
}

fn apply_interceptor(jobs: &mut [DestinationJob], interceptor: &InterceptorResponse) {
    for job in jobs
        .iter_mut()
        .filter(|j| is_valid_auth_error_category(&j.auth_error_category))
    {
        if interceptor.status_code > 0 {
            job.status_code = interceptor.status_code;
        }
        if !interceptor.response.is_empty() {
            job.error = interceptor.response.clone();
        }
    }
}

fn failed_for_all(message: &TransformMessage, status_code: u16, error: &str) -> Vec<DestinationJob> {
    message
        .data
        .iter()
        .map(|job| DestinationJob::failed(job, status_code, error))
        .collect()
}

impl RouterTransformer {
    /// Transform one destination batch. Unknown kinds and empty batches
    /// yield nothing. An `Err` is fatal; every other outcome, including a
    /// misbehaving service, comes back as one record per input job.
    #[instrument(skip_all, fields(kind = kind, dest_type = %message.dest_type))]
    pub async fn transform(
        &self,
        kind: &str,
        message: &TransformMessage,
    ) -> Result<Vec<DestinationJob>, TransformerError> {
        let Ok(kind) = kind.parse::<TransformKind>() else {
            return Ok(Vec::new());
        };
        let Some(first) = message.data.first() else {
            return Ok(Vec::new());
        };
        let start = Instant::now();

        let (dehydrated, preserved) = message.dehydrate();
        let compact = self.compact_request_payloads();
        let raw = if compact {
            serde_json::to_vec(&dehydrated.compacted())?
        } else {
            serde_json::to_vec(&dehydrated)?
        };
        let raw = Bytes::from(raw);

        let url = match kind {
            TransformKind::Batch => self.batch_url(),
            TransformKind::RouterTransform => self.router_transform_url(),
        };
        let endpoint = endpoint_of(&url);
        let labels = MetricLabels {
            endpoint: &endpoint,
            destination_type: &first.destination.destination_definition.name,
            source_type: &first.metadata.source_category,
            stage: "router",
            workspace_id: &first.metadata.workspace_id,
            destination_id: &first.destination.id,
            source_id: &first.metadata.source_id,
        }
        .to_tags();
        self.stats
            .count("transformer_client_request_total_bytes", &labels, raw.len() as u64);

        let destination = DestinationInfo::new(&first.metadata.workspace_id, &first.destination);
        let max_retry = self.settings.max_retry.current_value();
        let retry_sleep = self.settings.retry_sleep.current_value();

        let mut retry_count = 0u32;
        let response = loop {
            let request = self
                .transform_transport
                .plain
                .post(&url)
                .header(CONTENT_TYPE, "application/json; charset=utf-8")
                .header("X-Feature-Gzip-Support", "?1")
                .header("X-Feature-Filter-Code", "?1");
            let request = if compact {
                request.header("X-Content-Format", "json+compactedv1")
            } else {
                request
            };
            let request = request
                .body(raw.clone())
                .build()
                .map_err(|source| TransformerError::Request {
                    url: url.clone(),
                    source,
                })?;

            let attempt_start = Instant::now();
            let result = self
                .transform_transport
                .send(request, Some(&destination))
                .await;
            let elapsed = attempt_start.elapsed();
            self.stats
                .timing("router_transformer_request_time", &Tags::new(), elapsed);
            self.stats.count(
                "transformer_client_total_durations_seconds",
                &labels,
                elapsed.as_secs(),
            );

            match result {
                Ok(response) => {
                    self.stats.count(
                        "transformer_client_response_total_bytes",
                        &labels,
                        response.body.len() as u64,
                    );
                    if retry_count > 0 {
                        info!(url = %url, retry_count, "failed transformer request succeeded");
                    }
                    break response;
                }
                Err(source) => {
                    error!(url = %url, error = %source, retry_count, "transformer connection error");
                    if retry_count >= max_retry {
                        return Err(TransformerError::Connectivity {
                            url,
                            attempts: retry_count + 1,
                            source,
                        });
                    }
                    retry_count += 1;
                    tokio::time::sleep(retry_sleep).await;
                }
            }
        };

        let jobs = if response.status == 200 {
            let received = response
                .headers
                .get(API_VERSION_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u32>().ok())
                .unwrap_or(0);
            if received != SUPPORTED_API_VERSION {
                error!(expected = SUPPORTED_API_VERSION, received, url = %url, "incompatible transformer version");
                return Err(TransformerError::IncompatibleVersion {
                    expected: SUPPORTED_API_VERSION,
                    received,
                    url,
                });
            }

            let input = message.job_ids();
            let violation = match parse_response(kind, &response.body) {
                Ok(mut jobs) => {
                    if let Some(interceptor) = &response.interceptor {
                        apply_interceptor(&mut jobs, interceptor);
                    }
                    job_id_violation(&input, &jobs).map_or(Ok(jobs), Err)
                }
                Err(err) => Err((
                    "unmarshal error",
                    format!(
                        "Transformer returned invalid response: {} for input: {} ({err})",
                        String::from_utf8_lossy(&response.body),
                        String::from_utf8_lossy(&raw)
                    ),
                )),
            };
            match violation {
                Ok(jobs) => jobs,
                Err((reason, message_text)) => {
                    warn!(dest_type = %message.dest_type, reason, "transformer returned an invalid response");
                    self.stats.increment(
                        "router_transformer_invalid_response",
                        &tags([("destType", message.dest_type.as_str()), ("reason", reason)]),
                    );
                    failed_for_all(message, 500, &message_text)
                }
            }
        } else {
            error!(url = %url, status = response.status, "transformer returned non-success status");
            let status_code = if response.status == 404 { 404 } else { 500 };
            failed_for_all(message, status_code, &String::from_utf8_lossy(&response.body))
        };

        let mut jobs = jobs;
        preserved.hydrate(&mut jobs);
        self.stats.count(
            "transformer_client_request_total_events",
            &labels,
            message.data.len() as u64,
        );
        self.stats
            .count("transformer_client_response_total_events", &labels, jobs.len() as u64);
        self.stats
            .timing("transformer_client_total_time", &labels, start.elapsed());
        Ok(jobs)
    }
}
