//! In-Memory Control Plane
//!
//! A deterministic stand-in for the stream service: shards with full
//! genealogy, split/merge/update mutations, status transitions, and paginated
//! listings. Integration tests and local experiments drive every scaling path
//! against this module without touching the real provider.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::shard::ShardRecord;

use super::api::{
    ControlError, MetricQuery, MetricsApi, Notifier, Sample, ShardListing, StreamApi,
    StreamStatus, StreamSummary,
};

#[derive(Debug, Clone)]
struct SimShard {
    shard_id: String,
    parent_shard_id: Option<String>,
    adjacent_parent_shard_id: Option<String>,
    start_hash: u128,
    end_hash: u128,
    open: bool,
}

impl SimShard {
    fn to_record(&self) -> ShardRecord {
        ShardRecord {
            shard_id: self.shard_id.clone(),
            parent_shard_id: self.parent_shard_id.clone(),
            adjacent_parent_shard_id: self.adjacent_parent_shard_id.clone(),
            start_hash: self.start_hash,
            end_hash: self.end_hash,
        }
    }
}

#[derive(Debug)]
struct SimStream {
    shards: Vec<SimShard>,
    status: StreamStatus,
    /// Describes that still report the in-progress status before the stream
    /// settles back to ACTIVE
    pending_describes: u32,
    next_shard_number: u64,
}

impl SimStream {
    fn open_shards(&self) -> Vec<&SimShard> {
        self.shards.iter().filter(|s| s.open).collect()
    }

    fn allocate_shard_id(&mut self) -> String {
        let id = format!("shardId-{:012}", self.next_shard_number);
        self.next_shard_number += 1;
        id
    }
}

/// Kinds of mutation the simulator has executed, for invariant assertions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationEvent {
    Split { shard_id: String },
    Merge { lower: String, higher: String },
    UpdateShardCount { target: u64 },
}

/// In-memory stream control plane
pub struct SimKinesis {
    streams: Mutex<HashMap<String, SimStream>>,
    mutations: Mutex<Vec<MutationEvent>>,
    page_size: Mutex<usize>,
    /// When set, update-shard-count always fails with invalid-argument so
    /// callers exercise the split/merge fallback
    reject_update_shard_count: Mutex<bool>,
}

impl Default for SimKinesis {
    fn default() -> Self {
        Self::new()
    }
}

impl SimKinesis {
    pub fn new() -> Self {
        SimKinesis {
            streams: Mutex::new(HashMap::new()),
            mutations: Mutex::new(Vec::new()),
            page_size: Mutex::new(1000),
            reject_update_shard_count: Mutex::new(false),
        }
    }

    /// Create a stream with `count` evenly-sized open shards
    pub fn create_stream(&self, name: &str, count: u64) {
        let mut stream = SimStream {
            shards: Vec::new(),
            status: StreamStatus::Active,
            pending_describes: 0,
            next_shard_number: 0,
        };
        for i in 0..count {
            let start = even_boundary(i, count);
            let end = if i + 1 == count {
                u128::MAX
            } else {
                even_boundary(i + 1, count) - 1
            };
            let shard_id = stream.allocate_shard_id();
            stream.shards.push(SimShard {
                shard_id,
                parent_shard_id: None,
                adjacent_parent_shard_id: None,
                start_hash: start,
                end_hash: end,
                open: true,
            });
        }
        self.streams.lock().insert(name.to_string(), stream);
    }

    /// Shrink listing pages to exercise pagination
    pub fn set_page_size(&self, size: usize) {
        *self.page_size.lock() = size.max(1);
    }

    /// Force the atomic resize path to fail so callers fall back to
    /// split/merge
    pub fn reject_update_shard_count(&self, reject: bool) {
        *self.reject_update_shard_count.lock() = reject;
    }

    /// All mutations executed so far, in order
    pub fn mutation_log(&self) -> Vec<MutationEvent> {
        self.mutations.lock().clone()
    }

    /// Finish any in-progress mutation immediately. Tests use this to model
    /// an external actor whose resize completed between monitor cycles.
    pub fn settle_stream(&self, stream: &str) {
        if let Some(state) = self.streams.lock().get_mut(stream) {
            state.status = StreamStatus::Active;
            state.pending_describes = 0;
        }
    }

    /// Count of open shards, straight from simulator state
    pub fn open_shard_count(&self, stream: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .map(|s| s.open_shards().len())
            .unwrap_or(0)
    }

    fn with_active_stream<T>(
        &self,
        name: &str,
        apply: impl FnOnce(&mut SimStream) -> Result<T, ControlError>,
    ) -> Result<T, ControlError> {
        let mut streams = self.streams.lock();
        let stream = streams
            .get_mut(name)
            .ok_or_else(|| ControlError::NotFound(format!("stream {} does not exist", name)))?;
        if stream.status != StreamStatus::Active {
            return Err(ControlError::ResourceInUse(format!(
                "stream {} is {}",
                name, stream.status
            )));
        }
        let value = apply(stream)?;
        // every successful mutation leaves the stream updating until observed
        stream.status = StreamStatus::Updating;
        stream.pending_describes = 1;
        Ok(value)
    }

    fn split_open_shard(
        stream: &mut SimStream,
        shard_id: &str,
        new_starting_hash: u128,
    ) -> Result<(), ControlError> {
        let (start, end) = {
            let shard = stream
                .shards
                .iter()
                .find(|s| s.shard_id == shard_id && s.open)
                .ok_or_else(|| {
                    ControlError::NotFound(format!("open shard {} not found", shard_id))
                })?;
            (shard.start_hash, shard.end_hash)
        };
        if new_starting_hash <= start || new_starting_hash > end {
            return Err(ControlError::InvalidArgument(format!(
                "split point {} outside shard {} range",
                new_starting_hash, shard_id
            )));
        }
        let lower_id = stream.allocate_shard_id();
        let higher_id = stream.allocate_shard_id();
        let parent = Some(shard_id.to_string());
        stream.shards.push(SimShard {
            shard_id: lower_id,
            parent_shard_id: parent.clone(),
            adjacent_parent_shard_id: None,
            start_hash: start,
            end_hash: new_starting_hash - 1,
            open: true,
        });
        stream.shards.push(SimShard {
            shard_id: higher_id,
            parent_shard_id: parent,
            adjacent_parent_shard_id: None,
            start_hash: new_starting_hash,
            end_hash: end,
            open: true,
        });
        if let Some(shard) = stream.shards.iter_mut().find(|s| s.shard_id == shard_id) {
            shard.open = false;
        }
        Ok(())
    }

    fn merge_open_shards(
        stream: &mut SimStream,
        shard_id: &str,
        adjacent_shard_id: &str,
    ) -> Result<(), ControlError> {
        let a = stream
            .shards
            .iter()
            .find(|s| s.shard_id == shard_id && s.open)
            .cloned()
            .ok_or_else(|| ControlError::NotFound(format!("open shard {} not found", shard_id)))?;
        let b = stream
            .shards
            .iter()
            .find(|s| s.shard_id == adjacent_shard_id && s.open)
            .cloned()
            .ok_or_else(|| {
                ControlError::NotFound(format!("open shard {} not found", adjacent_shard_id))
            })?;
        let (lower, higher) = if a.start_hash < b.start_hash { (a, b) } else { (b, a) };
        if higher.start_hash != lower.end_hash.wrapping_add(1) || lower.end_hash == u128::MAX {
            return Err(ControlError::InvalidArgument(format!(
                "shards {} and {} are not hash-adjacent",
                shard_id, adjacent_shard_id
            )));
        }
        let merged_id = stream.allocate_shard_id();
        stream.shards.push(SimShard {
            shard_id: merged_id,
            parent_shard_id: Some(lower.shard_id.clone()),
            adjacent_parent_shard_id: Some(higher.shard_id.clone()),
            start_hash: lower.start_hash,
            end_hash: higher.end_hash,
            open: true,
        });
        for shard in stream.shards.iter_mut() {
            if shard.shard_id == lower.shard_id || shard.shard_id == higher.shard_id {
                shard.open = false;
            }
        }
        Ok(())
    }
}

/// `floor(2^128 * i / n)` without overflowing 128 bits
fn even_boundary(i: u64, n: u64) -> u128 {
    let i = i as u128;
    let n = n as u128;
    let quotient = u128::MAX / n;
    let remainder = u128::MAX % n + 1;
    quotient * i + (remainder * i) / n
}

#[async_trait]
impl StreamApi for SimKinesis {
    async fn describe_stream(&self, stream: &str) -> Result<StreamSummary, ControlError> {
        let mut streams = self.streams.lock();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| ControlError::NotFound(format!("stream {} does not exist", stream)))?;
        if state.status != StreamStatus::Active {
            if state.pending_describes > 0 {
                state.pending_describes -= 1;
            } else {
                state.status = StreamStatus::Active;
            }
        }
        Ok(StreamSummary {
            stream_name: stream.to_string(),
            status: state.status,
            open_shard_count: state.open_shards().len(),
        })
    }

    async fn list_shards_page(
        &self,
        stream: &str,
        exclusive_start_shard_id: Option<&str>,
        next_token: Option<&str>,
    ) -> Result<ShardListing, ControlError> {
        let streams = self.streams.lock();
        let state = streams
            .get(stream)
            .ok_or_else(|| ControlError::NotFound(format!("stream {} does not exist", stream)))?;

        // a continuation token is itself the exclusive lower bound
        let bound = next_token.or(exclusive_start_shard_id);
        let mut shards: Vec<&SimShard> = state
            .shards
            .iter()
            .filter(|s| bound.map(|b| s.shard_id.as_str() > b).unwrap_or(true))
            .collect();
        shards.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));

        let page_size = *self.page_size.lock();
        let page: Vec<ShardRecord> = shards.iter().take(page_size).map(|s| s.to_record()).collect();
        let next_token = if shards.len() > page_size {
            page.last().map(|s| s.shard_id.clone())
        } else {
            None
        };
        Ok(ShardListing {
            shards: page,
            next_token,
        })
    }

    async fn split_shard(
        &self,
        stream: &str,
        shard_id: &str,
        new_starting_hash: u128,
    ) -> Result<(), ControlError> {
        self.with_active_stream(stream, |state| {
            Self::split_open_shard(state, shard_id, new_starting_hash)
        })?;
        self.mutations.lock().push(MutationEvent::Split {
            shard_id: shard_id.to_string(),
        });
        Ok(())
    }

    async fn merge_shards(
        &self,
        stream: &str,
        shard_id: &str,
        adjacent_shard_id: &str,
    ) -> Result<(), ControlError> {
        self.with_active_stream(stream, |state| {
            Self::merge_open_shards(state, shard_id, adjacent_shard_id)
        })?;
        self.mutations.lock().push(MutationEvent::Merge {
            lower: shard_id.to_string(),
            higher: adjacent_shard_id.to_string(),
        });
        Ok(())
    }

    async fn update_shard_count(&self, stream: &str, target: u64) -> Result<(), ControlError> {
        if *self.reject_update_shard_count.lock() {
            return Err(ControlError::InvalidArgument(
                "update-shard-count disabled by simulator".to_string(),
            ));
        }
        self.with_active_stream(stream, |state| {
            let current = state.open_shards().len() as u64;
            if target == 0 {
                return Err(ControlError::InvalidArgument(
                    "target shard count must be positive".to_string(),
                ));
            }
            // the provider only honors a resize within [half, double]
            if target > current * 2 || target < current.div_ceil(2) {
                return Err(ControlError::InvalidArgument(format!(
                    "target {} outside [{}, {}] for current count {}",
                    target,
                    current.div_ceil(2),
                    current * 2,
                    current
                )));
            }
            while (state.open_shards().len() as u64) < target {
                let widest = state
                    .open_shards()
                    .iter()
                    .max_by_key(|s| s.end_hash - s.start_hash)
                    .map(|s| (s.shard_id.clone(), s.start_hash, s.end_hash))
                    .ok_or_else(|| ControlError::Other("stream has no open shards".into()))?;
                let (shard_id, start, end) = widest;
                let midpoint = start + (end - start) / 2 + 1;
                Self::split_open_shard(state, &shard_id, midpoint)?;
            }
            while (state.open_shards().len() as u64) > target {
                let open: Vec<(String, String, u128)> = {
                    let shards = {
                        let mut v = state.open_shards();
                        v.sort_by_key(|s| s.start_hash);
                        v
                    };
                    shards
                        .windows(2)
                        .map(|w| {
                            (
                                w[0].shard_id.clone(),
                                w[1].shard_id.clone(),
                                (w[0].end_hash - w[0].start_hash)
                                    .saturating_add(w[1].end_hash - w[1].start_hash),
                            )
                        })
                        .collect()
                };
                let narrowest = open
                    .into_iter()
                    .min_by_key(|(_, _, width)| *width)
                    .ok_or_else(|| ControlError::Other("no adjacent pair to merge".into()))?;
                Self::merge_open_shards(state, &narrowest.0, &narrowest.1)?;
            }
            Ok(())
        })?;
        self.mutations
            .lock()
            .push(MutationEvent::UpdateShardCount { target });
        Ok(())
    }
}

/// Scripted metrics backend: tests enqueue samples per metric name
#[derive(Default)]
pub struct SimMetrics {
    series: Mutex<HashMap<String, Vec<Sample>>>,
    failures_remaining: Mutex<u32>,
}

impl SimMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the samples returned for `metric_name`
    pub fn set_series(&self, metric_name: &str, samples: Vec<Sample>) {
        self.series
            .lock()
            .insert(metric_name.to_string(), samples);
    }

    /// Fail the next `count` queries with a transient error
    pub fn fail_next(&self, count: u32) {
        *self.failures_remaining.lock() = count;
    }
}

#[async_trait]
impl MetricsApi for SimMetrics {
    async fn sum_series(&self, query: &MetricQuery) -> Result<Vec<Sample>, ControlError> {
        {
            let mut failures = self.failures_remaining.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(ControlError::Transient(
                    "simulated metrics outage".to_string(),
                ));
            }
        }
        let series = self.series.lock();
        let samples = series
            .get(&query.metric_name)
            .map(|samples| {
                samples
                    .iter()
                    .filter(|s| s.timestamp >= query.start && s.timestamp <= query.end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(samples)
    }
}

/// A published notification, captured for assertions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub target: String,
    pub subject: String,
    pub body: String,
}

/// Notification sink that records instead of sending
#[derive(Default)]
pub struct SimNotifier {
    published: Mutex<Vec<PublishedMessage>>,
}

impl SimNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl Notifier for SimNotifier {
    async fn publish(
        &self,
        target: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), ControlError> {
        self.published.lock().push(PublishedMessage {
            target: target.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

/// Helper for scripting metric series in tests
pub fn sample_at(timestamp: DateTime<Utc>, sum: f64, unit: super::api::SampleUnit) -> Sample {
    Sample {
        timestamp,
        sum,
        unit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::OpenShardSet;

    #[tokio::test]
    async fn test_create_stream_covers_keyspace() {
        let sim = SimKinesis::new();
        sim.create_stream("orders", 4);
        let page = sim.list_shards_page("orders", None, None).await.unwrap();
        let set = OpenShardSet::from_listing(&page.shards).unwrap();
        assert_eq!(set.len(), 4);
        set.validate_coverage().unwrap();
    }

    #[tokio::test]
    async fn test_split_then_listing_classifies_children() {
        let sim = SimKinesis::new();
        sim.create_stream("orders", 1);
        sim.split_shard("orders", "shardId-000000000000", u128::MAX / 2)
            .await
            .unwrap();
        // drain the post-mutation status transition
        sim.describe_stream("orders").await.unwrap();
        let status = sim.describe_stream("orders").await.unwrap().status;
        assert_eq!(status, StreamStatus::Active);

        let page = sim.list_shards_page("orders", None, None).await.unwrap();
        assert_eq!(page.shards.len(), 3);
        let set = OpenShardSet::from_listing(&page.shards).unwrap();
        assert_eq!(set.len(), 2);
        set.validate_coverage().unwrap();
    }

    #[tokio::test]
    async fn test_mutation_rejected_while_updating() {
        let sim = SimKinesis::new();
        sim.create_stream("orders", 2);
        sim.merge_shards("orders", "shardId-000000000000", "shardId-000000000001")
            .await
            .unwrap();
        // no describe yet: the stream is still settling
        let result = sim
            .split_shard("orders", "shardId-000000000002", u128::MAX / 4)
            .await;
        assert!(matches!(result, Err(ControlError::ResourceInUse(_))));
    }

    #[tokio::test]
    async fn test_update_shard_count_bounds() {
        let sim = SimKinesis::new();
        sim.create_stream("orders", 4);
        let too_big = sim.update_shard_count("orders", 9).await;
        assert!(matches!(too_big, Err(ControlError::InvalidArgument(_))));
        let too_small = sim.update_shard_count("orders", 1).await;
        assert!(matches!(too_small, Err(ControlError::InvalidArgument(_))));

        sim.update_shard_count("orders", 8).await.unwrap();
        assert_eq!(sim.open_shard_count("orders"), 8);
    }

    #[tokio::test]
    async fn test_pagination_round_trip() {
        let sim = SimKinesis::new();
        sim.create_stream("orders", 5);
        sim.set_page_size(2);

        let mut all = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = sim
                .list_shards_page("orders", None, token.as_deref())
                .await
                .unwrap();
            all.extend(page.shards);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn test_merge_requires_adjacency() {
        let sim = SimKinesis::new();
        sim.create_stream("orders", 3);
        let result = sim
            .merge_shards("orders", "shardId-000000000000", "shardId-000000000002")
            .await;
        assert!(matches!(result, Err(ControlError::InvalidArgument(_))));
    }
}
