//! Stream Metrics Manager
//!
//! Tracks the maximum capacity of a stream per operation class (a fixed
//! per-shard constant times the open-shard count) and queries windowed
//! utilisation samples from the metrics backend, folding the per-metric
//! series into one bytes-per-second and one records-per-second series per
//! operation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ScalingResult;
use crate::kinesis::api::{MetricQuery, MetricsApi, SampleUnit};
use crate::kinesis::retry::{with_retries, BackoffPolicy};

/// Operation classes a stream can be scaled on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KinesisOperation {
    Put,
    Get,
}

impl std::fmt::Display for KinesisOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KinesisOperation::Put => write!(f, "PUT"),
            KinesisOperation::Get => write!(f, "GET"),
        }
    }
}

/// Fixed provider limits per open shard for one operation class
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OperationCapacity {
    pub bytes_per_sec: f64,
    pub records_per_sec: f64,
}

impl KinesisOperation {
    /// Per-shard service limits
    pub fn caps_per_shard(&self) -> OperationCapacity {
        match self {
            KinesisOperation::Put => OperationCapacity {
                bytes_per_sec: 1_048_576.0,
                records_per_sec: 1_000.0,
            },
            KinesisOperation::Get => OperationCapacity {
                bytes_per_sec: 2_097_152.0,
                records_per_sec: 2_000.0,
            },
        }
    }

    /// Metric names whose sums feed this operation's utilisation
    pub fn metric_names(&self) -> &'static [&'static str] {
        match self {
            KinesisOperation::Put => &[
                "PutRecord.Bytes",
                "PutRecords.Bytes",
                "PutRecord.Success",
                "PutRecords.Records",
            ],
            KinesisOperation::Get => &["GetRecords.Bytes", "GetRecords.Success"],
        }
    }
}

/// Sample period of the backend metrics
pub const METRIC_PERIOD_SECS: u32 = 60;

/// Utilisation rates keyed by operation and capacity dimension, one entry
/// per sample timestamp
pub type UtilisationSeries =
    HashMap<(KinesisOperation, SampleUnit), BTreeMap<DateTime<Utc>, f64>>;

/// Per-stream metrics state: current capacity and the query templates
pub struct MetricsManager {
    metrics: Arc<dyn MetricsApi>,
    stream_name: String,
    operations: Vec<KinesisOperation>,
    capacity: HashMap<KinesisOperation, OperationCapacity>,
    backoff: BackoffPolicy,
}

impl MetricsManager {
    pub fn new(
        metrics: Arc<dyn MetricsApi>,
        stream_name: String,
        operations: Vec<KinesisOperation>,
        backoff: BackoffPolicy,
    ) -> Self {
        MetricsManager {
            metrics,
            stream_name,
            operations,
            capacity: HashMap::new(),
            backoff,
        }
    }

    pub fn operations(&self) -> &[KinesisOperation] {
        &self.operations
    }

    /// Recompute stream capacity from the open-shard count
    pub fn update_capacity(&mut self, open_shards: usize) {
        for operation in &self.operations {
            let per_shard = operation.caps_per_shard();
            self.capacity.insert(
                *operation,
                OperationCapacity {
                    bytes_per_sec: per_shard.bytes_per_sec * open_shards as f64,
                    records_per_sec: per_shard.records_per_sec * open_shards as f64,
                },
            );
        }
        debug!(
            "stream {} capacity refreshed for {} open shards",
            self.stream_name, open_shards
        );
    }

    /// Current maximum capacity for one operation class. Zero until the
    /// first refresh.
    pub fn capacity(&self, operation: KinesisOperation) -> OperationCapacity {
        self.capacity
            .get(&operation)
            .copied()
            .unwrap_or(OperationCapacity {
                bytes_per_sec: 0.0,
                records_per_sec: 0.0,
            })
    }

    /// Execute every query template once over `[start, end]` and fold the
    /// results into per-second rates keyed by (operation, dimension). Two
    /// metrics sharing a timestamp within one dimension sum.
    pub async fn query_current_utilisation(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ScalingResult<UtilisationSeries> {
        let mut series: UtilisationSeries = HashMap::new();
        for operation in &self.operations {
            for metric_name in operation.metric_names() {
                let query = MetricQuery {
                    metric_name: metric_name.to_string(),
                    stream_name: self.stream_name.clone(),
                    start,
                    end,
                    period_secs: METRIC_PERIOD_SECS,
                };
                let samples = with_retries(&self.backoff, "get-metric-statistics", || {
                    self.metrics.sum_series(&query)
                })
                .await?;
                for sample in samples {
                    let rate = sample.sum / METRIC_PERIOD_SECS as f64;
                    *series
                        .entry((*operation, sample.unit))
                        .or_default()
                        .entry(sample.timestamp)
                        .or_insert(0.0) += rate;
                }
            }
        }
        Ok(series)
    }
}
