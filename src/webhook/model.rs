use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Who sent a webhook request, resolved from its write key.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthRequestContext {
    pub write_key: String,
    pub source_id: String,
    pub source_def_name: String,
    pub workspace_id: String,
    pub source_category: String,
}

/// Payload to hand back to the webhook caller verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputToSource {
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    pub content_type: String,
}

/// One element of the source transformer's answer, positionally matching
/// the request it was produced for.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TransformerResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_to_source: Option<OutputToSource>,
    pub status_code: u16,
    #[serde(rename = "error", skip_serializing_if = "String::is_empty")]
    pub err: String,
}

/// A request the transformer could not turn into events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookFailure {
    pub source_type: String,
    pub write_key: String,
    pub source_id: String,
    pub workspace_id: String,
    pub status_code: u16,
    pub reason: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct EnqueueError {
    pub status: u16,
    pub message: String,
}

/// Downstream of the webhook transformer.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Enqueue canonical events produced for one webhook request.
    async fn process_transformed_webhook_request(
        &self,
        req_type: &str,
        payload: Value,
        ctx: &AuthRequestContext,
    ) -> Result<(), EnqueueError>;

    async fn save_webhook_failures(&self, failures: Vec<WebhookFailure>) -> anyhow::Result<()>;
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
