//! Stream Scaler
//!
//! Public scaling API over one stream: up or down by count or percentage,
//! resize to an exact count, and report-only runs. Prefers the provider's
//! atomic resize and falls back to the split/merge topology pass when the
//! provider rejects the request.
//!
//! Percentages carry two interpretations, both preserved deliberately:
//! configuration documents use factor form ("grow/shrink to P% of current"),
//! while the CLI additionally accepts delta form ("add/remove P% of
//! current") for scale-up values at or below 100 and scale-down values at or
//! above 100. Applying the delta reading emits a warning naming both.

use tracing::{info, warn};

use crate::error::{ScalingError, ScalingResult};
use crate::kinesis::api::ControlError;
use crate::kinesis::control::StreamControl;
use crate::report::{EndStatus, ScaleDirection, ScalingReport};
use crate::topology::TopologyEngine;

/// How far to scale, as given by the operator or the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleBy {
    /// Add or remove this many shards
    Count(u64),
    /// Percentage, interpreted per the form rules above
    Pct(u32),
}

/// Optional stream-wide shard-count caps
#[derive(Debug, Clone, Copy, Default)]
pub struct ShardCaps {
    pub min_shards: Option<u64>,
    pub max_shards: Option<u64>,
}

impl ShardCaps {
    pub fn clamp(&self, target: u64) -> u64 {
        let mut clamped = target;
        if let Some(max) = self.max_shards {
            clamped = clamped.min(max);
        }
        if let Some(min) = self.min_shards {
            clamped = clamped.max(min);
        }
        clamped.max(1)
    }
}

/// Scaling facade for one provider connection
pub struct Scaler {
    control: StreamControl,
    engine: TopologyEngine,
}

impl Scaler {
    pub fn new(control: StreamControl) -> Self {
        let engine = TopologyEngine::new(control.clone());
        Scaler { control, engine }
    }

    /// Grow the stream per `by`, bounded by the caps
    pub async fn scale_up(
        &self,
        stream: &str,
        by: ScaleBy,
        caps: ShardCaps,
        wait_for_completion: bool,
    ) -> ScalingResult<ScalingReport> {
        let current = self.control.get_open_shard_count(stream).await? as u64;
        let target = scale_up_target(current, by)?;
        self.run(
            stream,
            current,
            target,
            ScaleDirection::Up,
            caps,
            wait_for_completion,
        )
        .await
    }

    /// Shrink the stream per `by`, bounded by the caps and never below one
    /// shard
    pub async fn scale_down(
        &self,
        stream: &str,
        by: ScaleBy,
        caps: ShardCaps,
        wait_for_completion: bool,
    ) -> ScalingResult<ScalingReport> {
        let current = self.control.get_open_shard_count(stream).await? as u64;
        if current <= 1 {
            return Err(ScalingError::AlreadyOneShard(stream.to_string()));
        }
        let target = scale_down_target(current, by)?;
        self.run(
            stream,
            current,
            target,
            ScaleDirection::Down,
            caps,
            wait_for_completion,
        )
        .await
    }

    /// Resize the stream to an exact shard count
    pub async fn resize(
        &self,
        stream: &str,
        count: u64,
        caps: ShardCaps,
        wait_for_completion: bool,
    ) -> ScalingResult<ScalingReport> {
        if count == 0 {
            return Err(ScalingError::InvalidTarget(
                "resize target must be at least 1".to_string(),
            ));
        }
        let current = self.control.get_open_shard_count(stream).await? as u64;
        let direction = match count.cmp(&current) {
            std::cmp::Ordering::Greater => ScaleDirection::Up,
            std::cmp::Ordering::Less => ScaleDirection::Down,
            std::cmp::Ordering::Equal => ScaleDirection::None,
        };
        self.run(stream, current, count, direction, caps, wait_for_completion)
            .await
    }

    /// Render the current layout without mutating anything
    pub async fn report(&self, stream: &str) -> ScalingResult<ScalingReport> {
        let layout = self.control.open_shard_set(stream).await?;
        Ok(ScalingReport {
            stream_name: stream.to_string(),
            end_status: EndStatus::ReportOnly,
            direction: ScaleDirection::None,
            operations_made: 0,
            layout,
            message: None,
        })
    }

    /// Split one named shard into `pieces` evenly-sized children
    pub async fn scale_up_shard(
        &self,
        stream: &str,
        shard_id: &str,
        pieces: u64,
        caps: ShardCaps,
    ) -> ScalingResult<ScalingReport> {
        let current = self.control.get_open_shard_count(stream).await? as u64;
        if let Some(max) = caps.max_shards {
            if current + pieces.saturating_sub(1) > max {
                return Ok(self
                    .capped_report(stream, ScaleDirection::Up, EndStatus::AlreadyAtMaximum)
                    .await?);
            }
        }
        let operations = self.engine.split_evenly(stream, shard_id, pieces).await?;
        self.finished_report(stream, ScaleDirection::Up, operations)
            .await
    }

    /// Merge one named shard with its hash-adjacent neighbour
    pub async fn scale_down_shard(
        &self,
        stream: &str,
        shard_id: &str,
        caps: ShardCaps,
    ) -> ScalingResult<ScalingReport> {
        let current = self.control.get_open_shard_count(stream).await? as u64;
        if current <= 1 {
            return Err(ScalingError::AlreadyOneShard(stream.to_string()));
        }
        if let Some(min) = caps.min_shards {
            if current <= min {
                return Ok(self
                    .capped_report(stream, ScaleDirection::Down, EndStatus::AlreadyAtMinimum)
                    .await?);
            }
        }
        let operations = self.engine.merge_adjacent(stream, shard_id).await?;
        self.finished_report(stream, ScaleDirection::Down, operations)
            .await
    }

    async fn run(
        &self,
        stream: &str,
        current: u64,
        requested_target: u64,
        direction: ScaleDirection,
        caps: ShardCaps,
        wait_for_completion: bool,
    ) -> ScalingResult<ScalingReport> {
        let target = caps.clamp(requested_target);
        if target != requested_target {
            info!(
                "target {} for stream {} clamped to {} by shard caps",
                requested_target, stream, target
            );
        }

        // a cap can invert the request when the stream already sits outside
        // the bounds; report the cap instead of moving the other way
        if direction == ScaleDirection::Up && target < current {
            return self
                .capped_report(stream, direction, EndStatus::AlreadyAtMaximum)
                .await;
        }
        if direction == ScaleDirection::Down && target > current {
            return self
                .capped_report(stream, direction, EndStatus::AlreadyAtMinimum)
                .await;
        }
        if target == current {
            let status = match direction {
                ScaleDirection::Up if caps.max_shards == Some(current) => {
                    EndStatus::AlreadyAtMaximum
                }
                ScaleDirection::Down if caps.min_shards == Some(current) => {
                    EndStatus::AlreadyAtMinimum
                }
                _ => EndStatus::NoActionRequired,
            };
            return self.capped_report(stream, direction, status).await;
        }

        // atomic provider resize first; split/merge only when it refuses
        match self
            .control
            .update_shard_count(stream, target, wait_for_completion)
            .await
        {
            Ok(()) => {
                info!(
                    "stream {} resized atomically from {} to {} shards",
                    stream, current, target
                );
                return self.finished_report(stream, direction, 1).await;
            }
            Err(ScalingError::Control(
                err @ (ControlError::InvalidArgument(_) | ControlError::Throttled(_)),
            )) => {
                info!(
                    "atomic resize of stream {} refused ({}), falling back to split/merge",
                    stream, err
                );
            }
            Err(other) => return Err(other),
        }

        let outcome = self
            .engine
            .rebalance(stream, target, caps.min_shards, caps.max_shards)
            .await?;
        let status = if outcome.operations_made > 0 {
            EndStatus::Ok
        } else if outcome.stopped_at_cap {
            match direction {
                ScaleDirection::Down => EndStatus::AlreadyAtMinimum,
                _ => EndStatus::AlreadyAtMaximum,
            }
        } else {
            EndStatus::NoActionRequired
        };
        Ok(ScalingReport {
            stream_name: stream.to_string(),
            end_status: status,
            direction,
            operations_made: outcome.operations_made,
            layout: outcome.layout,
            message: None,
        })
    }

    async fn finished_report(
        &self,
        stream: &str,
        direction: ScaleDirection,
        operations: u32,
    ) -> ScalingResult<ScalingReport> {
        let layout = self.control.open_shard_set(stream).await?;
        Ok(ScalingReport {
            stream_name: stream.to_string(),
            end_status: EndStatus::Ok,
            direction,
            operations_made: operations,
            layout,
            message: None,
        })
    }

    async fn capped_report(
        &self,
        stream: &str,
        direction: ScaleDirection,
        status: EndStatus,
    ) -> ScalingResult<ScalingReport> {
        let layout = self.control.open_shard_set(stream).await?;
        Ok(ScalingReport {
            stream_name: stream.to_string(),
            end_status: status,
            direction,
            operations_made: 0,
            layout,
            message: None,
        })
    }
}

/// Target for a scale-up request. Factor form above 100, delta form at or
/// below it.
fn scale_up_target(current: u64, by: ScaleBy) -> ScalingResult<u64> {
    match by {
        ScaleBy::Count(0) => Err(ScalingError::InvalidTarget(
            "scale-up count must be at least 1".to_string(),
        )),
        ScaleBy::Count(n) => Ok(current + n),
        ScaleBy::Pct(0) => Err(ScalingError::InvalidTarget(
            "scale-up percentage must be positive".to_string(),
        )),
        ScaleBy::Pct(pct) if pct > 100 => {
            // grow TO pct% of current, e.g. 200 doubles
            Ok(round_pct(current, pct).max(current))
        }
        ScaleBy::Pct(pct) => {
            // grow BY pct% of current, e.g. 15 adds 15% (at least one shard)
            warn!(
                "scale-up percentage {} is at or below 100 and is read as \
                 'add {}% of current', not 'grow to {}% of current'",
                pct, pct, pct
            );
            let added = (current * pct as u64).div_ceil(100).max(1);
            Ok(current + added)
        }
    }
}

/// Target for a scale-down request. Factor form below 100, delta form at or
/// above it; never below one shard.
fn scale_down_target(current: u64, by: ScaleBy) -> ScalingResult<u64> {
    match by {
        ScaleBy::Count(0) => Err(ScalingError::InvalidTarget(
            "scale-down count must be at least 1".to_string(),
        )),
        ScaleBy::Count(n) => Ok(current.saturating_sub(n).max(1)),
        ScaleBy::Pct(0) => Err(ScalingError::InvalidTarget(
            "scale-down percentage must be positive".to_string(),
        )),
        ScaleBy::Pct(pct) if pct < 100 => {
            // shrink TO pct% of current, e.g. 75 keeps three-quarters
            Ok(round_pct(current, pct).max(1))
        }
        ScaleBy::Pct(pct) => {
            // shrink BY pct% of current, clamped at one shard
            warn!(
                "scale-down percentage {} is at or above 100 and is read as \
                 'remove {}% of current', not 'shrink to {}% of current'",
                pct, pct, pct
            );
            let removed = round_pct(current, pct);
            Ok(current.saturating_sub(removed).max(1))
        }
    }
}

/// `current * pct / 100`, rounded half up
fn round_pct(current: u64, pct: u32) -> u64 {
    (current * pct as u64 + 50) / 100
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinesis::api::StreamApi;
    use crate::kinesis::retry::BackoffPolicy;
    use crate::kinesis::sim::SimKinesis;
    use std::sync::Arc;

    fn scaler(sim: &Arc<SimKinesis>) -> Scaler {
        let api: Arc<dyn StreamApi> = sim.clone();
        Scaler::new(StreamControl::new(api, BackoffPolicy::fast()))
    }

    #[test]
    fn test_scale_up_target_forms() {
        // delta form: add 15% of one shard, at least one
        assert_eq!(scale_up_target(1, ScaleBy::Pct(15)).unwrap(), 2);
        // factor form: 200% doubles
        assert_eq!(scale_up_target(7, ScaleBy::Pct(200)).unwrap(), 14);
        // delta form at the boundary adds the full current count
        assert_eq!(scale_up_target(4, ScaleBy::Pct(100)).unwrap(), 8);
        assert_eq!(scale_up_target(10, ScaleBy::Count(3)).unwrap(), 13);
        assert!(scale_up_target(10, ScaleBy::Count(0)).is_err());
        assert!(scale_up_target(10, ScaleBy::Pct(0)).is_err());
    }

    #[test]
    fn test_scale_down_target_forms() {
        // factor form: keep three-quarters
        assert_eq!(scale_down_target(8, ScaleBy::Pct(75)).unwrap(), 6);
        // delta form: removing 1200% clamps at one shard
        assert_eq!(scale_down_target(10, ScaleBy::Pct(1200)).unwrap(), 1);
        assert_eq!(scale_down_target(10, ScaleBy::Count(4)).unwrap(), 6);
        // count overshoot clamps at one shard
        assert_eq!(scale_down_target(3, ScaleBy::Count(9)).unwrap(), 1);
        assert!(scale_down_target(10, ScaleBy::Pct(0)).is_err());
    }

    #[test]
    fn test_caps_clamp() {
        let caps = ShardCaps {
            min_shards: Some(2),
            max_shards: Some(15),
        };
        assert_eq!(caps.clamp(17), 15);
        assert_eq!(caps.clamp(1), 2);
        assert_eq!(caps.clamp(9), 9);
        assert_eq!(ShardCaps::default().clamp(0), 1);
    }

    #[tokio::test]
    async fn test_atomic_path_counts_one_operation() {
        let sim = Arc::new(SimKinesis::new());
        sim.create_stream("orders", 7);
        let report = scaler(&sim)
            .scale_up("orders", ScaleBy::Pct(200), ShardCaps::default(), true)
            .await
            .unwrap();
        assert_eq!(report.end_status, EndStatus::Ok);
        assert_eq!(report.operations_made, 1);
        assert_eq!(report.layout.len(), 14);
    }

    #[tokio::test]
    async fn test_fallback_when_atomic_path_refused() {
        let sim = Arc::new(SimKinesis::new());
        sim.create_stream("orders", 2);
        sim.reject_update_shard_count(true);
        let report = scaler(&sim)
            .scale_up("orders", ScaleBy::Count(2), ShardCaps::default(), true)
            .await
            .unwrap();
        assert_eq!(report.end_status, EndStatus::Ok);
        assert_eq!(report.layout.len(), 4);
        assert!(report.operations_made >= 2);
    }

    #[tokio::test]
    async fn test_scale_down_from_one_shard() {
        let sim = Arc::new(SimKinesis::new());
        sim.create_stream("orders", 1);
        let result = scaler(&sim)
            .scale_down("orders", ScaleBy::Count(1), ShardCaps::default(), true)
            .await;
        assert!(matches!(result, Err(ScalingError::AlreadyOneShard(_))));
    }

    #[tokio::test]
    async fn test_scale_up_at_maximum_reports_cap() {
        let sim = Arc::new(SimKinesis::new());
        sim.create_stream("orders", 5);
        let caps = ShardCaps {
            min_shards: None,
            max_shards: Some(5),
        };
        let report = scaler(&sim)
            .scale_up("orders", ScaleBy::Count(3), caps, true)
            .await
            .unwrap();
        assert_eq!(report.end_status, EndStatus::AlreadyAtMaximum);
        assert_eq!(report.operations_made, 0);
        assert_eq!(report.layout.len(), 5);
    }

    #[tokio::test]
    async fn test_scale_up_never_shrinks_an_oversized_stream() {
        // the stream already exceeds the cap (e.g. resized externally); a
        // scale-up request must report the cap, not merge shards away
        let sim = Arc::new(SimKinesis::new());
        sim.create_stream("orders", 8);
        let caps = ShardCaps {
            min_shards: None,
            max_shards: Some(5),
        };
        let report = scaler(&sim)
            .scale_up("orders", ScaleBy::Count(2), caps, true)
            .await
            .unwrap();
        assert_eq!(report.end_status, EndStatus::AlreadyAtMaximum);
        assert_eq!(report.layout.len(), 8);
        assert!(sim.mutation_log().is_empty());
    }

    #[tokio::test]
    async fn test_resize_to_current_is_a_no_op() {
        let sim = Arc::new(SimKinesis::new());
        sim.create_stream("orders", 3);
        let report = scaler(&sim)
            .resize("orders", 3, ShardCaps::default(), true)
            .await
            .unwrap();
        assert_eq!(report.end_status, EndStatus::NoActionRequired);
        assert_eq!(report.operations_made, 0);
    }

    #[tokio::test]
    async fn test_report_only() {
        let sim = Arc::new(SimKinesis::new());
        sim.create_stream("orders", 3);
        let report = scaler(&sim).report("orders").await.unwrap();
        assert_eq!(report.end_status, EndStatus::ReportOnly);
        assert_eq!(report.layout.len(), 3);
        assert!(sim.mutation_log().is_empty());
    }

    #[tokio::test]
    async fn test_targeted_shard_split_and_merge() {
        let sim = Arc::new(SimKinesis::new());
        sim.create_stream("orders", 2);
        let s = scaler(&sim);
        let report = s
            .scale_up_shard("orders", "shardId-000000000000", 3, ShardCaps::default())
            .await
            .unwrap();
        assert_eq!(report.layout.len(), 4);

        let merged = s
            .scale_down_shard("orders", "shardId-000000000001", ShardCaps::default())
            .await
            .unwrap();
        assert_eq!(merged.layout.len(), 3);
        assert_eq!(merged.direction, ScaleDirection::Down);
    }
}
