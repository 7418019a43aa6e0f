//! Isolation strategies: how pending work is split into partitions that are
//! scheduled independently and concurrently.
use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IsolationError {
    #[error("unsupported isolation mode: {0}")]
    UnsupportedMode(String),
    #[error("destination throttled")]
    DestinationThrottled,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    #[default]
    None,
    Workspace,
    Destination,
}

impl IsolationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationMode::None => "none",
            IsolationMode::Workspace => "workspace",
            IsolationMode::Destination => "destination",
        }
    }
}

impl FromStr for IsolationMode {
    type Err = IsolationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(IsolationMode::None),
            "workspace" => Ok(IsolationMode::Workspace),
            "destination" => Ok(IsolationMode::Destination),
            other => Err(IsolationError::UnsupportedMode(other.to_string())),
        }
    }
}

/// Job parameters the store keeps a distinct-value index for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterName {
    WorkspaceId,
    SourceId,
    DestinationId,
}

impl ParameterName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterName::WorkspaceId => "workspace_id",
            ParameterName::SourceId => "source_id",
            ParameterName::DestinationId => "destination_id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterFilter {
    pub name: String,
    pub value: String,
}

/// Filter for fetching unprocessed jobs from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pub workspace_id: String,
    pub custom_val_filters: Vec<String>,
    pub parameter_filters: Vec<ParameterFilter>,
    pub jobs_limit: usize,
}

/// The slice of the job store the strategies need.
#[async_trait]
pub trait JobsDb: Send + Sync {
    async fn distinct_parameter_values(
        &self,
        parameter: ParameterName,
        custom_val: &str,
    ) -> Result<Vec<String>>;
}

#[async_trait]
pub trait Strategy: Send + Sync {
    /// Partitions that currently have work. Store failures are returned as-is.
    async fn active_partitions(&self, db: &dyn JobsDb) -> Result<Vec<String>>;

    /// Scope `params` to one partition.
    fn augment_query_params(&self, partition: &str, params: &mut QueryParams);

    /// Whether `err` should pause iteration for the partition that produced it.
    fn stop_iteration(&self, err: &anyhow::Error) -> bool;
}

pub type DestinationFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub fn strategy(
    mode: IsolationMode,
    custom_val: &str,
    destination_filter: DestinationFilter,
) -> Box<dyn Strategy> {
    match mode {
        IsolationMode::None => Box::new(NoneStrategy),
        IsolationMode::Workspace => Box::new(WorkspaceStrategy {
            custom_val: custom_val.to_string(),
        }),
        IsolationMode::Destination => Box::new(DestinationStrategy { destination_filter }),
    }
}

/// A single, unnamed partition.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoneStrategy;

#[async_trait]
impl Strategy for NoneStrategy {
    async fn active_partitions(&self, _db: &dyn JobsDb) -> Result<Vec<String>> {
        Ok(vec![String::new()])
    }

    fn augment_query_params(&self, _partition: &str, _params: &mut QueryParams) {}

    fn stop_iteration(&self, _err: &anyhow::Error) -> bool {
        false
    }
}

/// One partition per workspace with pending jobs.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceStrategy {
    custom_val: String,
}

#[async_trait]
impl Strategy for WorkspaceStrategy {
    async fn active_partitions(&self, db: &dyn JobsDb) -> Result<Vec<String>> {
        db.distinct_parameter_values(ParameterName::WorkspaceId, &self.custom_val)
            .await
    }

    fn augment_query_params(&self, partition: &str, params: &mut QueryParams) {
        params.workspace_id = partition.to_string();
    }

    fn stop_iteration(&self, _err: &anyhow::Error) -> bool {
        false
    }
}

/// One partition per destination accepted by the filter. A throttled
/// destination pauses only its own partition.
pub struct DestinationStrategy {
    destination_filter: DestinationFilter,
}

#[async_trait]
impl Strategy for DestinationStrategy {
    async fn active_partitions(&self, db: &dyn JobsDb) -> Result<Vec<String>> {
        let unfiltered = db
            .distinct_parameter_values(ParameterName::DestinationId, "")
            .await?;
        Ok(unfiltered
            .into_iter()
            .filter(|id| (self.destination_filter)(id))
            .collect())
    }

    fn augment_query_params(&self, partition: &str, params: &mut QueryParams) {
        params.parameter_filters.push(ParameterFilter {
            name: ParameterName::DestinationId.as_str().to_string(),
            value: partition.to_string(),
        });
    }

    fn stop_iteration(&self, err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<IsolationError>(),
                Some(IsolationError::DestinationThrottled)
            )
        })
    }
}

/// What happened to one partition during a scheduling round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionOutcome {
    pub partition: String,
    pub iterations: usize,
    pub stopped: bool,
}

/// Run one scheduling round. Every active partition iterates concurrently with
/// its own augmented query; `worker` returns `Ok(true)` while more work is
/// pending. An error the strategy recognises ends that partition's round only.
#[instrument(skip_all)]
pub async fn run_round<F, Fut>(
    strategy: &dyn Strategy,
    db: &dyn JobsDb,
    base: &QueryParams,
    max_iterations: usize,
    worker: F,
) -> Result<Vec<PartitionOutcome>>
where
    F: Fn(String, QueryParams) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let partitions = strategy.active_partitions(db).await?;
    let worker = &worker;
    let rounds = partitions.into_iter().map(|partition| {
        let mut params = base.clone();
        strategy.augment_query_params(&partition, &mut params);
        async move {
            let mut outcome = PartitionOutcome {
                partition,
                iterations: 0,
                stopped: false,
            };
            while outcome.iterations < max_iterations {
                outcome.iterations += 1;
                match worker(outcome.partition.clone(), params.clone()).await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(err) if strategy.stop_iteration(&err) => {
                        debug!(partition = %outcome.partition, %err, "pausing partition");
                        outcome.stopped = true;
                        break;
                    }
                    Err(err) => {
                        warn!(partition = %outcome.partition, ?err, "partition iteration failed");
                    }
                }
            }
            outcome
        }
    });
    Ok(join_all(rounds).await)
}
