//! Control-Plane Capability Traits
//!
//! Narrow async interfaces over the external collaborators: the stream
//! control plane, the metrics backend, and the notification sink. Concrete
//! implementations live in `kinesis::aws` (SDK clients) and `kinesis::sim`
//! (in-memory control plane); everything above these traits is agnostic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::shard::ShardRecord;

/// Control-plane failure classes, classified at the SDK boundary so the
/// retry loop never inspects provider exception types.
#[derive(Debug, Clone, Error)]
pub enum ControlError {
    /// The stream is mid-mutation; retry after a fixed pause
    #[error("resource in use: {0}")]
    ResourceInUse(String),

    /// Rate limit hit; retry with exponential backoff
    #[error("throttled: {0}")]
    Throttled(String),

    /// Request was malformed; never retried
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Stream or shard does not exist; never retried
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Metrics-backend validation failure; never retried
    #[error("validation error: {0}")]
    Validation(String),

    /// Network-level or service-internal failure; retried with backoff
    #[error("transient failure: {0}")]
    Transient(String),

    /// Anything else; surfaced immediately
    #[error("{0}")]
    Other(String),
}

impl ControlError {
    /// True for failures the retry policy may attempt again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControlError::ResourceInUse(_)
                | ControlError::Throttled(_)
                | ControlError::Transient(_)
        )
    }
}

/// Stream lifecycle states reported by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Creating,
    Deleting,
    Active,
    Updating,
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamStatus::Creating => write!(f, "CREATING"),
            StreamStatus::Deleting => write!(f, "DELETING"),
            StreamStatus::Active => write!(f, "ACTIVE"),
            StreamStatus::Updating => write!(f, "UPDATING"),
        }
    }
}

/// Stream state relevant to scaling decisions
#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub stream_name: String,
    pub status: StreamStatus,
    pub open_shard_count: usize,
}

/// One page of a shard listing
#[derive(Debug, Clone, Default)]
pub struct ShardListing {
    pub shards: Vec<ShardRecord>,
    pub next_token: Option<String>,
}

/// Raw stream control plane. One logical call per method, no retries; the
/// `StreamControl` shim layers the retry policy and waiting on top.
#[async_trait]
pub trait StreamApi: Send + Sync {
    async fn describe_stream(&self, stream: &str) -> Result<StreamSummary, ControlError>;

    /// One listing page. `exclusive_start_shard_id` bounds the listing from
    /// below on the first page; `next_token` continues a prior page and is
    /// mutually exclusive with the other parameters.
    async fn list_shards_page(
        &self,
        stream: &str,
        exclusive_start_shard_id: Option<&str>,
        next_token: Option<&str>,
    ) -> Result<ShardListing, ControlError>;

    /// Split `shard_id` so the higher child starts at `new_starting_hash`
    async fn split_shard(
        &self,
        stream: &str,
        shard_id: &str,
        new_starting_hash: u128,
    ) -> Result<(), ControlError>;

    /// Merge two hash-adjacent open shards
    async fn merge_shards(
        &self,
        stream: &str,
        shard_id: &str,
        adjacent_shard_id: &str,
    ) -> Result<(), ControlError>;

    /// Atomic provider-side resize to an exact shard count
    async fn update_shard_count(&self, stream: &str, target: u64) -> Result<(), ControlError>;
}

/// Unit of a utilisation sample, distinguishing the two capacity dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleUnit {
    Bytes,
    Count,
}

/// One windowed datapoint from the metrics backend
#[derive(Debug, Clone)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    /// Sum over the sample period
    pub sum: f64,
    pub unit: SampleUnit,
}

/// A single metric query: one metric name over one stream, SUM statistic
#[derive(Debug, Clone)]
pub struct MetricQuery {
    pub metric_name: String,
    pub stream_name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub period_secs: u32,
}

/// Read-only metrics backend
#[async_trait]
pub trait MetricsApi: Send + Sync {
    /// Execute one query template, returning its datapoints in any order
    async fn sum_series(&self, query: &MetricQuery) -> Result<Vec<Sample>, ControlError>;
}

/// Notification sink for completed scaling actions
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(
        &self,
        target: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), ControlError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ControlError::ResourceInUse("busy".into()).is_retryable());
        assert!(ControlError::Throttled("slow down".into()).is_retryable());
        assert!(ControlError::Transient("conn reset".into()).is_retryable());
        assert!(!ControlError::InvalidArgument("bad hash".into()).is_retryable());
        assert!(!ControlError::NotFound("no stream".into()).is_retryable());
        assert!(!ControlError::Validation("bad metric".into()).is_retryable());
        assert!(!ControlError::Other("??".into()).is_retryable());
    }
}
