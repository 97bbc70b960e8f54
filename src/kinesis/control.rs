//! Stream Control Shim
//!
//! Thin capability over the raw control plane: pagination, retry policy,
//! wait-for-active, and derivation of the ordered open-shard set. Holds no
//! shard state; every view is re-queried from the provider.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{ScalingError, ScalingResult};
use crate::shard::{OpenShardSet, ShardRecord};

use super::api::{StreamApi, StreamStatus, StreamSummary};
use super::retry::{with_retries, BackoffPolicy};

/// Retry-wrapped control-plane access for one provider connection. Cheap to
/// clone; monitors own one each.
#[derive(Clone)]
pub struct StreamControl {
    api: Arc<dyn StreamApi>,
    backoff: BackoffPolicy,
}

impl StreamControl {
    pub fn new(api: Arc<dyn StreamApi>, backoff: BackoffPolicy) -> Self {
        StreamControl { api, backoff }
    }

    /// Describe the stream under the retry policy
    pub async fn describe_stream(&self, stream: &str) -> ScalingResult<StreamSummary> {
        let summary = with_retries(&self.backoff, "describe-stream", || {
            self.api.describe_stream(stream)
        })
        .await?;
        Ok(summary)
    }

    /// Full shard listing, optionally bounded from below by an exclusive
    /// shard id. Pagination terminates strictly on absence of a next token.
    pub async fn list_shards(
        &self,
        stream: &str,
        after_shard_id: Option<&str>,
    ) -> ScalingResult<Vec<ShardRecord>> {
        let mut shards = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = with_retries(&self.backoff, "list-shards", || {
                self.api
                    .list_shards_page(stream, after_shard_id, token.as_deref())
            })
            .await?;
            shards.extend(page.shards);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        debug!("listed {} shards for stream {}", shards.len(), stream);
        Ok(shards)
    }

    /// Look up a single shard by id
    pub async fn get_shard(&self, stream: &str, shard_id: &str) -> ScalingResult<ShardRecord> {
        let shards = self.list_shards(stream, None).await?;
        shards
            .into_iter()
            .find(|s| s.shard_id == shard_id)
            .ok_or_else(|| {
                ScalingError::resolution_failure(format!(
                    "shard {} not found in stream {}",
                    shard_id, stream
                ))
            })
    }

    /// Derive the ordered open-shard set from a fresh listing
    pub async fn open_shard_set(&self, stream: &str) -> ScalingResult<OpenShardSet> {
        let listing = self.list_shards(stream, None).await?;
        let set = OpenShardSet::from_listing(&listing)?;
        set.validate_coverage()?;
        Ok(set)
    }

    /// Count of currently open shards
    pub async fn get_open_shard_count(&self, stream: &str) -> ScalingResult<usize> {
        Ok(self.open_shard_set(stream).await?.len())
    }

    /// Split a shard so the higher child starts at `new_starting_hash`,
    /// optionally blocking until the stream returns to ACTIVE.
    pub async fn split_shard(
        &self,
        stream: &str,
        shard_id: &str,
        new_starting_hash: u128,
        wait_for_active: bool,
    ) -> ScalingResult<()> {
        info!(
            "splitting shard {} of stream {} at hash {}",
            shard_id, stream, new_starting_hash
        );
        with_retries(&self.backoff, "split-shard", || {
            self.api.split_shard(stream, shard_id, new_starting_hash)
        })
        .await?;
        if wait_for_active {
            self.wait_for_status(stream, StreamStatus::Active).await?;
        }
        Ok(())
    }

    /// Merge two hash-adjacent open shards, optionally blocking until the
    /// stream returns to ACTIVE.
    pub async fn merge_shards(
        &self,
        stream: &str,
        lower_shard_id: &str,
        higher_shard_id: &str,
        wait_for_active: bool,
    ) -> ScalingResult<()> {
        info!(
            "merging shards {} + {} of stream {}",
            lower_shard_id, higher_shard_id, stream
        );
        with_retries(&self.backoff, "merge-shards", || {
            self.api.merge_shards(stream, lower_shard_id, higher_shard_id)
        })
        .await?;
        if wait_for_active {
            self.wait_for_status(stream, StreamStatus::Active).await?;
        }
        Ok(())
    }

    /// Provider-side atomic resize. Surfaces invalid-argument and
    /// limit-exceeded to the caller so it can fall back to split/merge.
    pub async fn update_shard_count(
        &self,
        stream: &str,
        target: u64,
        wait_for_active: bool,
    ) -> ScalingResult<()> {
        info!("requesting shard count {} for stream {}", target, stream);
        with_retries(&self.backoff, "update-shard-count", || {
            self.api.update_shard_count(stream, target)
        })
        .await?;
        if wait_for_active {
            self.wait_for_status(stream, StreamStatus::Active).await?;
        }
        Ok(())
    }

    /// Poll stream status until it reaches `wanted`. Polls once up front,
    /// then waits the policy's initial delay and its poll interval.
    pub async fn wait_for_status(
        &self,
        stream: &str,
        wanted: StreamStatus,
    ) -> ScalingResult<()> {
        let mut first = true;
        loop {
            let summary = self.describe_stream(stream).await?;
            if summary.status == wanted {
                return Ok(());
            }
            debug!(
                "stream {} is {}, waiting for {}",
                stream, summary.status, wanted
            );
            let delay = if first {
                self.backoff.status_initial_wait
            } else {
                self.backoff.status_poll_interval
            };
            first = false;
            tokio::time::sleep(delay).await;
        }
    }
}
