#![allow(dead_code)]

use axum::Router;
use chrono::{DateTime, Utc};
use event_relay::config::{Config, TransformerSettings, WebhookSettings};
use event_relay::model::{
    Connection, Destination, DestinationDefinition, Job, JobMetadata, JobParameters, JobStatus,
    RouterJob, TransformMessage,
};
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Serve `app` on an ephemeral port and return its base URL.
pub async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// A URL nothing listens on.
pub async fn closed_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

pub fn config(url: &str) -> Config {
    let raw = format!(
        "app:\n  data_dir: ./data\ntransformer:\n  url: {url}\n  max_retry: 2\n  retry_sleep_ms: 1\nwebhook:\n  batch_timeout_ms: 5\n  max_retry: 2\n  retry_sleep_ms: 1\n"
    );
    let cfg: Config = serde_yaml::from_str(&raw).unwrap();
    event_relay::config::validate(&cfg).unwrap();
    cfg
}

pub fn transformer_settings(url: &str) -> TransformerSettings {
    let mut settings = TransformerSettings::from_config(&config(url));
    settings.timeout = Duration::from_secs(5);
    settings.destination_timeout = Duration::from_secs(5);
    settings
}

pub fn webhook_settings(url: &str) -> WebhookSettings {
    let mut settings = WebhookSettings::from_config(&config(url));
    settings.transformer_timeout = Duration::from_secs(5);
    settings
}

pub fn job(job_id: i64, destination_id: &str) -> Job {
    Job {
        job_id,
        user_id: format!("user-{job_id}"),
        workspace_id: "ws-1".into(),
        custom_val: "WEBHOOK".into(),
        event_count: 1,
        event_payload: json!({ "event": "Signed Up" }),
        parameters: JobParameters {
            source_id: "src-1".into(),
            destination_id: destination_id.into(),
            source_category: "webhook".into(),
            received_at: "2024-01-01T00:00:00Z".into(),
        },
        created_at: DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc),
        last_job_status: JobStatus::default(),
    }
}

pub fn destination(id: &str, oauth: bool) -> Destination {
    let mut definition_config = Map::new();
    if oauth {
        definition_config.insert("auth".into(), json!({ "type": "OAuth" }));
    }
    Destination {
        id: id.into(),
        name: format!("dest {id}"),
        destination_definition: DestinationDefinition {
            id: "def-1".into(),
            name: "WEBHOOK".into(),
            display_name: "Webhook".into(),
            config: definition_config,
        },
        enabled: true,
        workspace_id: "ws-1".into(),
        ..Default::default()
    }
}

pub fn router_job(job_id: i64, destination: &Destination) -> RouterJob {
    let job = job(job_id, &destination.id);
    RouterJob {
        message: json!({ "type": "track", "jobId": job_id }),
        metadata: JobMetadata::from_job(&job),
        destination: destination.clone(),
        connection: Connection {
            source_id: "src-1".into(),
            destination_id: destination.id.clone(),
            enabled: true,
            ..Default::default()
        },
    }
}

pub fn batch(ids: &[i64]) -> TransformMessage {
    batch_for(ids, &destination("d-1", false))
}

pub fn batch_for(ids: &[i64], destination: &Destination) -> TransformMessage {
    TransformMessage::new(
        "WEBHOOK",
        ids.iter().map(|id| router_job(*id, destination)).collect(),
    )
    .unwrap()
}

/// One successful output record per input job, echoing its metadata.
pub fn echo_records(request: &Value, status_code: u16) -> Value {
    let records: Vec<Value> = request["input"]
        .as_array()
        .map(|jobs| {
            jobs.iter()
                .map(|job| {
                    json!({
                        "batchedRequest": { "payload": job["message"] },
                        "metadata": [job["metadata"]],
                        "batched": false,
                        "statusCode": status_code,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Value::Array(records)
}
