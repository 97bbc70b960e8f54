//! Shard Topology Engine
//!
//! Converges a stream's open-shard set to a target cardinality with
//! near-uniform keyspace shares, using the minimum number of provider
//! mutations and never more than one mutation in flight. The working
//! structure is a stack fed in descending start-hash order, so shards are
//! consumed ascending and the early keyspace consolidates first.

use std::cmp::Ordering;

use tracing::{debug, info};

use crate::error::{ScalingError, ScalingResult};
use crate::hash_math::{even_split_point, soft_compare, KeyspacePct};
use crate::kinesis::control::StreamControl;
use crate::shard::{AdjacentPair, OpenShardSet, ShardInfo};

/// Result of one rebalance pass
#[derive(Debug)]
pub struct RebalanceOutcome {
    /// Provider mutations issued during the pass
    pub operations_made: u32,
    /// Open-shard set enumerated after the last successful mutation
    pub layout: OpenShardSet,
    /// True when a min/max cap condition ended the pass
    pub stopped_at_cap: bool,
}

/// Split/merge planner and executor over one stream control handle
pub struct TopologyEngine {
    control: StreamControl,
}

impl TopologyEngine {
    pub fn new(control: StreamControl) -> Self {
        TopologyEngine { control }
    }

    /// Rebalance `stream` to `target` open shards of ≈ 1/target keyspace
    /// share each, honoring the optional shard-count caps on every
    /// iteration.
    pub async fn rebalance(
        &self,
        stream: &str,
        target: u64,
        min_shards: Option<u64>,
        max_shards: Option<u64>,
    ) -> ScalingResult<RebalanceOutcome> {
        if target == 0 {
            return Err(ScalingError::InvalidTarget(
                "target shard count must be at least 1".to_string(),
            ));
        }
        let target_share = KeyspacePct::fraction(target);
        if target_share == KeyspacePct::ZERO {
            return Err(ScalingError::InvalidTarget(format!(
                "target shard count {} exceeds the keyspace comparison scale",
                target
            )));
        }

        let open = self.control.open_shard_set(stream).await?;
        let mut current = open.len() as u64;
        let mut highest_seen = open.highest_shard_id().map(String::from);
        let mut stack = open.descending_stack();
        let mut operations = 0u32;
        let mut stopped_at_cap = false;

        info!(
            "rebalancing stream {} from {} to {} open shards",
            stream, current, target
        );

        loop {
            if let Some(min) = min_shards {
                if current == min && target <= min {
                    stopped_at_cap = true;
                    debug!("stream {} reached minimum cap {}", stream, min);
                    break;
                }
            }
            if let Some(max) = max_shards {
                if current == max && target >= max {
                    stopped_at_cap = true;
                    debug!("stream {} reached maximum cap {}", stream, max);
                    break;
                }
            }

            let Some(shard) = stack.pop() else { break };

            match soft_compare(shard.pct(), target_share) {
                Ordering::Greater => {
                    // too wide: carve a complete lower fragment of share t
                    let higher = self
                        .split_at_share(stream, &shard, target_share, &mut highest_seen)
                        .await?;
                    operations += 1;
                    current += 1;
                    stack.push(higher);
                }
                Ordering::Equal => {
                    debug!("shard {} already holds the target share", shard.shard_id);
                }
                Ordering::Less => {
                    // too narrow: absorb the next shard up
                    let Some(next) = stack.pop() else { break };
                    let combined = shard.pct().saturating_add(next.pct());
                    if soft_compare(combined, target_share) == Ordering::Greater {
                        // carve just enough off the neighbour, then merge
                        let remainder = target_share.saturating_sub(shard.pct());
                        let (lower_fragment, higher_fragment) = self
                            .split_off_fragment(stream, &next, remainder, &mut highest_seen)
                            .await?;
                        operations += 1;
                        current += 1;
                        let pair = AdjacentPair::new(shard, lower_fragment)?;
                        self.merge_pair(stream, &pair, &mut highest_seen).await?;
                        operations += 1;
                        current -= 1;
                        stack.push(higher_fragment);
                    } else {
                        // merge outright; the result may still be too narrow
                        let pair = AdjacentPair::new(shard, next)?;
                        let merged = self.merge_pair(stream, &pair, &mut highest_seen).await?;
                        operations += 1;
                        current -= 1;
                        stack.push(merged);
                    }
                }
            }
        }

        let layout = self.control.open_shard_set(stream).await?;
        info!(
            "rebalance of stream {} complete: {} operations, {} open shards",
            stream,
            operations,
            layout.len()
        );
        Ok(RebalanceOutcome {
            operations_made: operations,
            layout,
            stopped_at_cap,
        })
    }

    /// Split one shard into `pieces` evenly-sized children. Used by the
    /// targeted CLI path; the stream-wide pass above never calls this.
    pub async fn split_evenly(
        &self,
        stream: &str,
        shard_id: &str,
        pieces: u64,
    ) -> ScalingResult<u32> {
        if pieces < 2 {
            return Err(ScalingError::InvalidTarget(
                "a shard can only split into two or more pieces".to_string(),
            ));
        }
        let open = self.control.open_shard_set(stream).await?;
        let shard = open.find(shard_id).ok_or_else(|| {
            ScalingError::resolution_failure(format!(
                "shard {} is not open in stream {}",
                shard_id, stream
            ))
        })?;
        let (start, end) = (shard.start_hash, shard.end_hash);
        let mut highest_seen = open.highest_shard_id().map(String::from);
        let mut operations = 0u32;
        let mut fragment = shard.clone();

        // peel complete children off the low end, one split at a time
        for i in 1..pieces {
            let boundary = even_split_point(start, end, i, pieces);
            if boundary <= fragment.start_hash || boundary > fragment.end_hash {
                return Err(ScalingError::InvalidTarget(format!(
                    "shard {} is too narrow to split into {} pieces",
                    shard_id, pieces
                )));
            }
            self.control
                .split_shard(stream, &fragment.shard_id, boundary, true)
                .await?;
            operations += 1;
            let children = self.new_shards_after(stream, &highest_seen).await?;
            track_highest(&mut highest_seen, &children);
            fragment = children
                .iter()
                .find(|s| s.start_hash == boundary)
                .cloned()
                .ok_or_else(|| {
                    ScalingError::resolution_failure(format!(
                        "higher fragment starting at {} not found after split",
                        boundary
                    ))
                })?;
        }
        Ok(operations)
    }

    /// Merge one shard with its hash-adjacent neighbour (the one above, or
    /// the one below when the shard tops the keyspace)
    pub async fn merge_adjacent(&self, stream: &str, shard_id: &str) -> ScalingResult<u32> {
        let open = self.control.open_shard_set(stream).await?;
        let shard = open.find(shard_id).ok_or_else(|| {
            ScalingError::resolution_failure(format!(
                "shard {} is not open in stream {}",
                shard_id, stream
            ))
        })?;
        let mut highest_seen = open.highest_shard_id().map(String::from);
        let pair = match open.neighbour_above(shard_id) {
            Some(above) => AdjacentPair::new(shard.clone(), above.clone())?,
            None => {
                let below = open.neighbour_below(shard_id).ok_or_else(|| {
                    ScalingError::AlreadyOneShard(stream.to_string())
                })?;
                AdjacentPair::new(below.clone(), shard.clone())?
            }
        };
        self.merge_pair(stream, &pair, &mut highest_seen).await?;
        Ok(1)
    }

    /// Split `shard` so its lower child covers exactly `share`; returns the
    /// higher child.
    async fn split_at_share(
        &self,
        stream: &str,
        shard: &ShardInfo,
        share: KeyspacePct,
        highest_seen: &mut Option<String>,
    ) -> ScalingResult<ShardInfo> {
        let width = share.hash_units();
        if width == 0 || width > shard.end_hash - shard.start_hash {
            return Err(ScalingError::InvalidTarget(format!(
                "cannot carve a {} share out of shard {}",
                share, shard.shard_id
            )));
        }
        let new_start = shard.start_hash + width;
        self.control
            .split_shard(stream, &shard.shard_id, new_start, true)
            .await?;
        let children = self.new_shards_after(stream, highest_seen).await?;
        track_highest(highest_seen, &children);
        children
            .into_iter()
            .find(|s| s.start_hash == new_start)
            .ok_or_else(|| {
                ScalingError::resolution_failure(format!(
                    "higher child starting at {} not found after splitting {}",
                    new_start, shard.shard_id
                ))
            })
    }

    /// Split `shard` into a lower fragment of `share` and a higher
    /// remainder; returns both in hash order.
    async fn split_off_fragment(
        &self,
        stream: &str,
        shard: &ShardInfo,
        share: KeyspacePct,
        highest_seen: &mut Option<String>,
    ) -> ScalingResult<(ShardInfo, ShardInfo)> {
        let width = share.hash_units();
        if width == 0 || width > shard.end_hash - shard.start_hash {
            return Err(ScalingError::InvalidTarget(format!(
                "cannot carve a {} fragment out of shard {}",
                share, shard.shard_id
            )));
        }
        let new_start = shard.start_hash + width;
        self.control
            .split_shard(stream, &shard.shard_id, new_start, true)
            .await?;
        let children = self.new_shards_after(stream, highest_seen).await?;
        track_highest(highest_seen, &children);
        let lower = children.iter().find(|s| s.start_hash == shard.start_hash);
        let higher = children.iter().find(|s| s.start_hash == new_start);
        match (lower, higher) {
            (Some(lower), Some(higher)) => Ok((lower.clone(), higher.clone())),
            _ => Err(ScalingError::resolution_failure(format!(
                "children of split shard {} not found in refreshed listing",
                shard.shard_id
            ))),
        }
    }

    /// Merge an adjacent pair and return the resulting shard
    async fn merge_pair(
        &self,
        stream: &str,
        pair: &AdjacentPair,
        highest_seen: &mut Option<String>,
    ) -> ScalingResult<ShardInfo> {
        self.control
            .merge_shards(
                stream,
                &pair.lower.shard_id,
                &pair.higher.shard_id,
                true,
            )
            .await?;
        let created = self.new_shards_after(stream, highest_seen).await?;
        track_highest(highest_seen, &created);
        created
            .into_iter()
            .find(|s| s.start_hash == pair.lower.start_hash)
            .ok_or_else(|| {
                ScalingError::resolution_failure(format!(
                    "merged child of {} + {} not found in refreshed listing",
                    pair.lower.shard_id, pair.higher.shard_id
                ))
            })
    }

    /// Shards created since `highest_seen`, via a lower-exclusive bounded
    /// listing so reconciliation reads only the new entries
    async fn new_shards_after(
        &self,
        stream: &str,
        highest_seen: &Option<String>,
    ) -> ScalingResult<Vec<ShardInfo>> {
        let records = self
            .control
            .list_shards(stream, highest_seen.as_deref())
            .await?;
        Ok(records.iter().map(ShardInfo::from_record).collect())
    }
}

fn track_highest(highest_seen: &mut Option<String>, created: &[ShardInfo]) {
    for shard in created {
        match highest_seen {
            Some(current) if shard.shard_id.as_str() <= current.as_str() => {}
            _ => *highest_seen = Some(shard.shard_id.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinesis::api::StreamApi;
    use crate::kinesis::retry::BackoffPolicy;
    use crate::kinesis::sim::SimKinesis;
    use std::sync::Arc;

    fn engine(sim: &Arc<SimKinesis>) -> TopologyEngine {
        let api: Arc<dyn StreamApi> = sim.clone();
        TopologyEngine::new(StreamControl::new(api, BackoffPolicy::fast()))
    }

    fn assert_balanced(layout: &OpenShardSet, target: u64) {
        assert_eq!(layout.len() as u64, target);
        layout.validate_coverage().unwrap();
        let want = KeyspacePct::fraction(target);
        for shard in layout.shards() {
            assert_eq!(
                soft_compare(shard.pct(), want),
                Ordering::Equal,
                "shard {} holds {} instead of {}",
                shard.shard_id,
                shard.pct(),
                want
            );
        }
    }

    #[tokio::test]
    async fn test_scale_up_one_to_four() {
        let sim = Arc::new(SimKinesis::new());
        sim.create_stream("orders", 1);
        let outcome = engine(&sim)
            .rebalance("orders", 4, None, None)
            .await
            .unwrap();
        assert_balanced(&outcome.layout, 4);
        // pure scale-up needs exactly target - current splits
        assert_eq!(outcome.operations_made, 3);
        assert!(!outcome.stopped_at_cap);
    }

    #[tokio::test]
    async fn test_scale_down_four_to_two() {
        let sim = Arc::new(SimKinesis::new());
        sim.create_stream("orders", 4);
        let outcome = engine(&sim)
            .rebalance("orders", 2, None, None)
            .await
            .unwrap();
        assert_balanced(&outcome.layout, 2);
        // even halving merges pairs without compensating splits
        assert_eq!(outcome.operations_made, 2);
    }

    #[tokio::test]
    async fn test_uneven_rebalance_three_to_two() {
        let sim = Arc::new(SimKinesis::new());
        sim.create_stream("orders", 3);
        let outcome = engine(&sim)
            .rebalance("orders", 2, None, None)
            .await
            .unwrap();
        assert_balanced(&outcome.layout, 2);
        // merge + compensating split, bounded by 2x the cardinality delta
        assert!(outcome.operations_made <= 2 * 3);
    }

    #[tokio::test]
    async fn test_rebalance_is_a_no_op_when_balanced() {
        let sim = Arc::new(SimKinesis::new());
        sim.create_stream("orders", 4);
        let outcome = engine(&sim)
            .rebalance("orders", 4, None, None)
            .await
            .unwrap();
        assert_eq!(outcome.operations_made, 0);
        assert_balanced(&outcome.layout, 4);
    }

    #[tokio::test]
    async fn test_scale_up_op_count_bounds() {
        let sim = Arc::new(SimKinesis::new());
        sim.create_stream("orders", 3);
        let outcome = engine(&sim)
            .rebalance("orders", 7, None, None)
            .await
            .unwrap();
        assert_balanced(&outcome.layout, 7);
        assert!(outcome.operations_made >= 4);
        assert!(outcome.operations_made <= 8);
    }

    #[tokio::test]
    async fn test_max_cap_stops_pass() {
        let sim = Arc::new(SimKinesis::new());
        sim.create_stream("orders", 2);
        let outcome = engine(&sim)
            .rebalance("orders", 10, None, Some(4))
            .await
            .unwrap();
        assert_eq!(outcome.layout.len(), 4);
        assert!(outcome.stopped_at_cap);
    }

    #[tokio::test]
    async fn test_min_cap_stops_pass() {
        let sim = Arc::new(SimKinesis::new());
        sim.create_stream("orders", 8);
        let outcome = engine(&sim)
            .rebalance("orders", 1, Some(4), None)
            .await
            .unwrap();
        assert_eq!(outcome.layout.len(), 4);
        assert!(outcome.stopped_at_cap);
    }

    #[tokio::test]
    async fn test_every_merge_was_adjacent_and_stream_stayed_serial() {
        let sim = Arc::new(SimKinesis::new());
        sim.create_stream("orders", 5);
        engine(&sim).rebalance("orders", 3, None, None).await.unwrap();
        // the simulator rejects non-adjacent merges and concurrent
        // mutations outright, so surviving the pass proves both invariants;
        // double-check some mutation actually happened
        assert!(!sim.mutation_log().is_empty());
    }

    #[tokio::test]
    async fn test_zero_target_is_rejected() {
        let sim = Arc::new(SimKinesis::new());
        sim.create_stream("orders", 2);
        let result = engine(&sim).rebalance("orders", 0, None, None).await;
        assert!(matches!(result, Err(ScalingError::InvalidTarget(_))));
    }

    #[tokio::test]
    async fn test_split_evenly() {
        let sim = Arc::new(SimKinesis::new());
        sim.create_stream("orders", 2);
        let ops = engine(&sim)
            .split_evenly("orders", "shardId-000000000000", 3)
            .await
            .unwrap();
        assert_eq!(ops, 2);
        assert_eq!(sim.open_shard_count("orders"), 4);
    }

    #[tokio::test]
    async fn test_merge_adjacent_picks_higher_neighbour() {
        let sim = Arc::new(SimKinesis::new());
        sim.create_stream("orders", 3);
        let ops = engine(&sim)
            .merge_adjacent("orders", "shardId-000000000001")
            .await
            .unwrap();
        assert_eq!(ops, 1);
        assert_eq!(sim.open_shard_count("orders"), 2);
    }
}
