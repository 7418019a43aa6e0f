//! Append-only JSON-lines store standing in for the job queue.
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::webhook::{AuthRequestContext, EnqueueError, Gateway, WebhookFailure};

pub const EVENTS_FILE: &str = "events.jsonl";
pub const FAILURES_FILE: &str = "webhook_failures.jsonl";

/// One enqueued webhook request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventRecord<'a> {
    req_type: &'a str,
    write_key: &'a str,
    source_id: &'a str,
    workspace_id: &'a str,
    received_at: chrono::DateTime<Utc>,
    payload: &'a Value,
}

#[derive(Debug)]
pub struct FileEventSink {
    events: PathBuf,
    failures: PathBuf,
    write_lock: Mutex<()>,
}

impl FileEventSink {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let dir = data_dir.as_ref();
        Self {
            events: dir.join(EVENTS_FILE),
            failures: dir.join(FAILURES_FILE),
            write_lock: Mutex::new(()),
        }
    }

    pub fn events_path(&self) -> &Path {
        &self.events
    }

    pub fn failures_path(&self) -> &Path {
        &self.failures
    }

    async fn append(&self, path: &Path, lines: Vec<Vec<u8>>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        for mut line in lines {
            line.push(b'\n');
            file.write_all(&line)
                .await
                .with_context(|| format!("appending to {}", path.display()))?;
        }
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Gateway for FileEventSink {
    async fn process_transformed_webhook_request(
        &self,
        req_type: &str,
        payload: Value,
        ctx: &AuthRequestContext,
    ) -> Result<(), EnqueueError> {
        let record = EventRecord {
            req_type,
            write_key: &ctx.write_key,
            source_id: &ctx.source_id,
            workspace_id: &ctx.workspace_id,
            received_at: Utc::now(),
            payload: &payload,
        };
        let line = serde_json::to_vec(&record).map_err(|err| EnqueueError {
            status: 400,
            message: format!("invalid event payload: {err}"),
        })?;
        self.append(&self.events, vec![line])
            .await
            .map_err(|err| EnqueueError {
                status: 500,
                message: format!("storing events failed: {err:#}"),
            })?;
        debug!(source_id = %ctx.source_id, "webhook events stored");
        Ok(())
    }

    async fn save_webhook_failures(&self, failures: Vec<WebhookFailure>) -> Result<()> {
        let lines = failures
            .iter()
            .map(serde_json::to_vec)
            .collect::<Result<Vec<_>, _>>()
            .context("encoding webhook failures")?;
        self.append(&self.failures, lines).await
    }
}
