//! Wire shapes of webhook requests sent to the source transformer.
use anyhow::{Context, Result};
use axum::http::{HeaderMap, Request, Version};
use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::config::AdapterVersion;

const WRITE_KEY_PARAM: &str = "writeKey";

pub trait SourceTransformAdapter: Send + Sync {
    fn version(&self) -> AdapterVersion;

    /// Transformer event for one inbound request.
    fn transformer_event(
        &self,
        request: &Request<Bytes>,
        source_type: &str,
        parse_params_for: &[String],
    ) -> Result<Vec<u8>>;

    fn transformer_url(&self, base_url: &str, source_type: &str) -> String {
        format!(
            "{}/{}/sources/{}",
            base_url.trim_end_matches('/'),
            self.version().as_str(),
            source_type.to_ascii_lowercase()
        )
    }
}

/// Body with `query_parameters` attached for allow-listed sources.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdapterV0;

/// The whole HTTP request as a JSON envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdapterV1;

impl SourceTransformAdapter for AdapterV0 {
    fn version(&self) -> AdapterVersion {
        AdapterVersion::V0
    }

    fn transformer_event(
        &self,
        request: &Request<Bytes>,
        source_type: &str,
        parse_params_for: &[String],
    ) -> Result<Vec<u8>> {
        prepare_event_request_v0(request, source_type, parse_params_for)
    }
}

impl SourceTransformAdapter for AdapterV1 {
    fn version(&self) -> AdapterVersion {
        AdapterVersion::V1
    }

    fn transformer_event(
        &self,
        request: &Request<Bytes>,
        _source_type: &str,
        _parse_params_for: &[String],
    ) -> Result<Vec<u8>> {
        prepare_event_request_v1(request)
    }
}

pub fn adapter_for(version: AdapterVersion) -> &'static dyn SourceTransformAdapter {
    match version {
        AdapterVersion::V0 => &AdapterV0,
        AdapterVersion::V1 => &AdapterV1,
    }
}

/// Query string as name → values, without the write key.
pub fn query_parameters(request: &Request<Bytes>) -> BTreeMap<String, Vec<String>> {
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if let Some(query) = request.uri().query() {
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if name == WRITE_KEY_PARAM {
                continue;
            }
            params
                .entry(name.into_owned())
                .or_default()
                .push(value.into_owned());
        }
    }
    params
}

pub fn prepare_event_request_v0(
    request: &Request<Bytes>,
    source_type: &str,
    parse_params_for: &[String],
) -> Result<Vec<u8>> {
    let body = request.body();
    let source = source_type.to_ascii_lowercase();
    let include_params = parse_params_for.iter().any(|s| *s == source);

    let parsed = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        serde_json::from_slice::<Value>(body).ok()
    };

    if !include_params {
        return Ok(match parsed {
            Some(_) => body.to_vec(),
            None => b"{}".to_vec(),
        });
    }

    let mut object = match parsed {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let params = serde_json::to_value(query_parameters(request))
        .context("encoding query parameters")?;
    object.insert("query_parameters".into(), params);
    serde_json::to_vec(&object).context("encoding v0 transformer event")
}

#[derive(Serialize)]
struct RequestEnvelope {
    method: String,
    url: String,
    proto: &'static str,
    headers: BTreeMap<String, Vec<String>>,
    body: String,
    query_parameters: BTreeMap<String, Vec<String>>,
}

fn proto(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

/// `content-type` → `Content-Type`.
pub fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}

fn headers(map: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in map {
        headers
            .entry(canonical_header_name(name.as_str()))
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    headers
}

pub fn prepare_event_request_v1(request: &Request<Bytes>) -> Result<Vec<u8>> {
    let body = if request.body().is_empty() {
        "{}".to_string()
    } else {
        std::str::from_utf8(request.body())
            .context("request body is not valid UTF-8")?
            .to_string()
    };
    let url = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let envelope = RequestEnvelope {
        method: request.method().as_str().to_string(),
        url,
        proto: proto(request.version()),
        headers: headers(request.headers()),
        body,
        query_parameters: query_parameters(request),
    };
    serde_json::to_vec(&envelope).context("encoding v1 transformer event")
}
