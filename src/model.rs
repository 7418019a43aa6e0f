//! Router-side data model: jobs, destinations, and the batch envelopes
//! exchanged with the transformation service.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("job {job_id} targets destination {found}, batch destination is {expected}")]
    MixedDestinations {
        job_id: i64,
        expected: String,
        found: String,
    },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Unprocessed,
    Executing,
    Waiting,
    Succeeded,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct JobStatus {
    pub job_state: JobState,
    pub attempt_num: u32,
    pub error_code: String,
    pub error_response: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JobParameters {
    pub source_id: String,
    pub destination_id: String,
    pub source_category: String,
    pub received_at: String,
}

/// A unit of work as stored in the job store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: i64,
    pub user_id: String,
    pub workspace_id: String,
    pub custom_val: String,
    pub event_count: u32,
    pub event_payload: Value,
    pub parameters: JobParameters,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_job_status: JobStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct JobMetadata {
    pub user_id: String,
    pub job_id: i64,
    pub source_id: String,
    pub source_category: String,
    pub destination_id: String,
    pub attempt_num: u32,
    pub received_at: String,
    pub created_at: String,
    pub workspace_id: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub secret: Value,
    #[serde(rename = "jobsT", skip_serializing_if = "Option::is_none")]
    pub job: Option<Job>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub dest_info: Value,
    pub dont_batch: bool,
    #[serde(rename = "traceparent")]
    pub trace_parent: String,
}

impl JobMetadata {
    /// Metadata for `job`, embedding the job itself.
    pub fn from_job(job: &Job) -> Self {
        Self {
            user_id: job.user_id.clone(),
            job_id: job.job_id,
            source_id: job.parameters.source_id.clone(),
            source_category: job.parameters.source_category.clone(),
            destination_id: job.parameters.destination_id.clone(),
            attempt_num: job.last_job_status.attempt_num,
            received_at: job.parameters.received_at.clone(),
            created_at: job.created_at.to_rfc3339(),
            workspace_id: job.workspace_id.clone(),
            job: Some(job.clone()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DestinationDefinition {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub config: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Destination {
    pub id: String,
    pub name: String,
    pub destination_definition: DestinationDefinition,
    pub config: Map<String, Value>,
    pub enabled: bool,
    pub workspace_id: String,
    pub revision_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Connection {
    pub source_id: String,
    pub destination_id: String,
    pub enabled: bool,
    pub config: Map<String, Value>,
    pub processor_enabled: bool,
}

fn connection_key(source_id: &str, destination_id: &str) -> String {
    format!("{source_id}:{destination_id}")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouterJob {
    pub message: Value,
    pub metadata: JobMetadata,
    pub destination: Destination,
    pub connection: Connection,
}

/// A batch of jobs bound for a single destination.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TransformMessage {
    #[serde(rename = "input")]
    pub data: Vec<RouterJob>,
    #[serde(rename = "destType")]
    pub dest_type: String,
}

/// Values stripped by `dehydrate`, needed to `hydrate` the response.
#[derive(Debug, Clone, Default)]
pub struct PreservedData {
    jobs: HashMap<i64, Job>,
    destinations: HashMap<String, Destination>,
    connections: HashMap<String, Connection>,
}

impl TransformMessage {
    pub fn new(dest_type: impl Into<String>, data: Vec<RouterJob>) -> Result<Self, ModelError> {
        if let Some(first) = data.first() {
            let expected = &first.destination.id;
            if let Some(other) = data.iter().find(|j| &j.destination.id != expected) {
                return Err(ModelError::MixedDestinations {
                    job_id: other.metadata.job_id,
                    expected: expected.clone(),
                    found: other.destination.id.clone(),
                });
            }
        }
        Ok(Self {
            data,
            dest_type: dest_type.into(),
        })
    }

    pub fn job_ids(&self) -> HashSet<i64> {
        self.data.iter().map(|j| j.metadata.job_id).collect()
    }

    /// Copy of the message without the embedded jobs, plus what was removed.
    pub fn dehydrate(&self) -> (TransformMessage, PreservedData) {
        let mut preserved = PreservedData::default();
        let mut copy = self.clone();
        for job in &mut copy.data {
            if let Some(stored) = job.metadata.job.take() {
                preserved.jobs.insert(job.metadata.job_id, stored);
            }
            preserved
                .destinations
                .entry(job.destination.id.clone())
                .or_insert_with(|| job.destination.clone());
            preserved
                .connections
                .entry(connection_key(
                    &job.connection.source_id,
                    &job.connection.destination_id,
                ))
                .or_insert_with(|| job.connection.clone());
        }
        (copy, preserved)
    }

    /// Wire form with destinations and connections listed once per batch.
    pub fn compacted(&self) -> CompactedTransformMessage {
        let mut destinations = BTreeMap::new();
        let mut connections = BTreeMap::new();
        let data = self
            .data
            .iter()
            .map(|job| {
                destinations
                    .entry(job.destination.id.clone())
                    .or_insert_with(|| job.destination.clone());
                connections
                    .entry(connection_key(
                        &job.metadata.source_id,
                        &job.metadata.destination_id,
                    ))
                    .or_insert_with(|| job.connection.clone());
                CompactedRouterJob {
                    message: job.message.clone(),
                    metadata: job.metadata.clone(),
                }
            })
            .collect();
        CompactedTransformMessage {
            data,
            dest_type: self.dest_type.clone(),
            destinations,
            connections,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompactedRouterJob {
    pub message: Value,
    pub metadata: JobMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompactedTransformMessage {
    #[serde(rename = "input")]
    pub data: Vec<CompactedRouterJob>,
    #[serde(rename = "destType")]
    pub dest_type: String,
    pub destinations: BTreeMap<String, Destination>,
    pub connections: BTreeMap<String, Connection>,
}

/// One output record of the transformation service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DestinationJob {
    #[serde(rename = "batchedRequest")]
    pub message: Value,
    #[serde(rename = "metadata")]
    pub job_metadata_array: Vec<JobMetadata>,
    pub destination: Destination,
    pub connection: Connection,
    pub batched: bool,
    pub status_code: u16,
    pub error: String,
    pub auth_error_category: String,
}

impl DestinationJob {
    /// Synthetic failure standing in for `job`.
    pub fn failed(job: &RouterJob, status_code: u16, error: impl Into<String>) -> Self {
        Self {
            message: job.message.clone(),
            job_metadata_array: vec![job.metadata.clone()],
            destination: job.destination.clone(),
            connection: job.connection.clone(),
            batched: false,
            status_code,
            error: error.into(),
            auth_error_category: String::new(),
        }
    }

    pub fn job_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.job_metadata_array.iter().map(|m| m.job_id)
    }
}

impl PreservedData {
    /// Restore stripped jobs and fill destinations/connections the service
    /// left out.
    pub fn hydrate(&self, jobs: &mut [DestinationJob]) {
        for dj in jobs.iter_mut() {
            for metadata in &mut dj.job_metadata_array {
                if metadata.job.is_none() {
                    metadata.job = self.jobs.get(&metadata.job_id).cloned();
                }
            }
            let Some(first) = dj.job_metadata_array.first() else {
                continue;
            };
            if dj.destination.id.is_empty() {
                if let Some(dest) = self.destinations.get(&first.destination_id) {
                    dj.destination = dest.clone();
                }
            }
            if dj.connection.source_id.is_empty() {
                let key = connection_key(&first.source_id, &first.destination_id);
                if let Some(conn) = self.connections.get(&key) {
                    dj.connection = conn.clone();
                }
            }
        }
    }
}
