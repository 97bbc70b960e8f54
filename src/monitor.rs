//! Stream Monitor
//!
//! The per-stream autoscaling control loop. Each cycle samples windowed
//! utilisation, summarizes every (operation, dimension) series, votes per
//! operation on its governing dimension, combines the votes, and drives the
//! scaler while honoring cooldowns and shard caps. Completed actions refresh
//! the cached capacity and publish to the configured notification target.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{ScalingConfig, StreamPolicy};
use crate::error::{ScalingError, ScalingResult};
use crate::kinesis::api::{MetricsApi, Notifier, SampleUnit, StreamApi};
use crate::kinesis::control::StreamControl;
use crate::kinesis::retry::BackoffPolicy;
use crate::metrics::{KinesisOperation, MetricsManager, UtilisationSeries};
use crate::report::{EndStatus, ScaleDirection, ScalingReport};
use crate::scaler::{Scaler, ShardCaps};
use crate::shard::OpenShardSet;

/// Aggregate of one (operation, dimension) sample series over the decision
/// window
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct DimensionSummary {
    pub high_samples: u32,
    pub low_samples: u32,
    pub avg_pct: f64,
}

/// Combine per-operation votes into the final decision: any UP wins, then
/// any DOWN, otherwise no action.
pub fn combine_votes(votes: &[ScaleDirection]) -> ScaleDirection {
    if votes.iter().any(|v| *v == ScaleDirection::Up) {
        ScaleDirection::Up
    } else if votes.iter().any(|v| *v == ScaleDirection::Down) {
        ScaleDirection::Down
    } else {
        ScaleDirection::None
    }
}

/// Autoscaling loop for a single stream. Owns its policy, provider clients,
/// metrics state, and cooldown timestamps; nothing here is shared between
/// monitors.
pub struct StreamMonitor {
    policy: StreamPolicy,
    control: StreamControl,
    scaler: Scaler,
    metrics: MetricsManager,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    last_scale_up: Option<DateTime<Utc>>,
    last_scale_down: Option<DateTime<Utc>>,
    last_capacity_refresh: Option<DateTime<Utc>>,
    report_tx: Option<mpsc::UnboundedSender<ScalingReport>>,
}

impl StreamMonitor {
    pub fn new(
        policy: StreamPolicy,
        stream_api: Arc<dyn StreamApi>,
        metrics_api: Arc<dyn MetricsApi>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        backoff: BackoffPolicy,
    ) -> Self {
        let control = StreamControl::new(stream_api, backoff.clone());
        let scaler = Scaler::new(control.clone());
        let metrics = MetricsManager::new(
            metrics_api,
            policy.stream_name.clone(),
            policy.scale_on_operations.clone(),
            backoff,
        );
        StreamMonitor {
            policy,
            control,
            scaler,
            metrics,
            notifier,
            clock,
            last_scale_up: None,
            last_scale_down: None,
            last_capacity_refresh: None,
            report_tx: None,
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.policy.stream_name
    }

    pub fn last_scale_up(&self) -> Option<DateTime<Utc>> {
        self.last_scale_up
    }

    pub fn last_scale_down(&self) -> Option<DateTime<Utc>> {
        self.last_scale_down
    }

    /// Stream of every terminal decision report this monitor produces
    pub fn subscribe_reports(&mut self) -> mpsc::UnboundedReceiver<ScalingReport> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.report_tx = Some(tx);
        rx
    }

    /// Run until the shutdown signal flips. The loop exits after the current
    /// cycle finishes; no in-flight provider call is abandoned.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ScalingResult<()> {
        info!(
            "starting monitor for stream {} (cycle every {}s)",
            self.policy.stream_name, self.policy.check_interval_sec
        );
        self.refresh_capacity().await?;

        let mut ticker = tokio::time::interval(StdDuration::from_secs(
            self.policy.check_interval_sec.max(1) as u64,
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!(
                            "monitor cycle for stream {} failed: {}",
                            self.policy.stream_name, e
                        );
                        self.emit(ScalingReport {
                            stream_name: self.policy.stream_name.clone(),
                            end_status: EndStatus::Error,
                            direction: ScaleDirection::None,
                            operations_made: 0,
                            layout: OpenShardSet::new(),
                            message: Some(e.to_string()),
                        });
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("monitor for stream {} stopped", self.policy.stream_name);
        Ok(())
    }

    /// One decision cycle. Public so tests can drive the monitor against a
    /// manual clock without the ticker.
    pub async fn run_cycle(&mut self) -> ScalingResult<()> {
        let now = self.clock.now();
        self.maybe_refresh_capacity(now).await?;

        let window_mins = self.window_mins();
        if window_mins == 0 {
            debug!(
                "stream {} has no decision window configured, skipping cycle",
                self.policy.stream_name
            );
            return Ok(());
        }
        let start = now - Duration::minutes(window_mins as i64);
        let series = self.metrics.query_current_utilisation(start, now).await?;

        let mut votes = Vec::new();
        for operation in self.policy.scale_on_operations.clone() {
            let vote = self.vote_for(operation, &series, window_mins);
            debug!(
                "stream {} operation {} votes {:?}",
                self.policy.stream_name, operation, vote
            );
            votes.push(vote);
        }
        let decision = combine_votes(&votes);

        match decision {
            ScaleDirection::Up => self.act(ScaleDirection::Up, now).await,
            ScaleDirection::Down => self.act(ScaleDirection::Down, now).await,
            ScaleDirection::None => {
                debug!(
                    "stream {} within thresholds, no action",
                    self.policy.stream_name
                );
                Ok(())
            }
        }
    }

    /// Decision window: the longer of the two directions' qualifying spans
    fn window_mins(&self) -> u32 {
        let up = self.policy.scale_up.as_ref().map(|c| c.after_mins).unwrap_or(0);
        let down = self
            .policy
            .scale_down
            .as_ref()
            .map(|c| c.after_mins)
            .unwrap_or(0);
        up.max(down)
    }

    /// Summarize one dimension of one operation over the window. Missing
    /// samples pad the low count: an idle minute reports nothing.
    fn summarize(
        &self,
        operation: KinesisOperation,
        unit: SampleUnit,
        series: &UtilisationSeries,
        window_mins: u32,
    ) -> DimensionSummary {
        let capacity = self.metrics.capacity(operation);
        let limit = match unit {
            SampleUnit::Bytes => capacity.bytes_per_sec,
            SampleUnit::Count => capacity.records_per_sec,
        };
        let up_threshold = self
            .policy
            .scale_up
            .as_ref()
            .map(|c| c.threshold_pct as f64 / 100.0);
        let down_threshold = self
            .policy
            .scale_down
            .as_ref()
            .map(|c| c.threshold_pct as f64 / 100.0);

        let empty = BTreeMap::new();
        let samples = series.get(&(operation, unit)).unwrap_or(&empty);
        let mut summary = DimensionSummary::default();
        let mut total_pct = 0.0;
        for rate in samples.values() {
            let pct = if limit > 0.0 { rate / limit } else { 0.0 };
            total_pct += pct;
            if up_threshold.map(|t| pct > t).unwrap_or(false) {
                summary.high_samples += 1;
            }
            if down_threshold.map(|t| pct < t).unwrap_or(false) {
                summary.low_samples += 1;
            }
        }
        summary.low_samples += window_mins.saturating_sub(samples.len() as u32);
        summary.avg_pct = total_pct / window_mins as f64;
        summary
    }

    /// Vote for one operation based on its governing dimension, the one with
    /// the larger average utilisation.
    fn vote_for(
        &self,
        operation: KinesisOperation,
        series: &UtilisationSeries,
        window_mins: u32,
    ) -> ScaleDirection {
        let bytes = self.summarize(operation, SampleUnit::Bytes, series, window_mins);
        let records = self.summarize(operation, SampleUnit::Count, series, window_mins);
        let governing = if records.avg_pct > bytes.avg_pct {
            records
        } else {
            bytes
        };

        if let Some(up) = &self.policy.scale_up {
            if governing.high_samples >= up.after_mins {
                return ScaleDirection::Up;
            }
        }
        if let Some(down) = &self.policy.scale_down {
            if governing.low_samples >= down.after_mins {
                return ScaleDirection::Down;
            }
        }
        ScaleDirection::None
    }

    async fn act(&mut self, direction: ScaleDirection, now: DateTime<Utc>) -> ScalingResult<()> {
        let config = match direction {
            ScaleDirection::Up => self.policy.scale_up.clone(),
            _ => self.policy.scale_down.clone(),
        };
        let Some(config) = config else {
            // votes only arise from a configured direction
            return Ok(());
        };

        let last = match direction {
            ScaleDirection::Up => self.last_scale_up,
            _ => self.last_scale_down,
        };
        if let Some(completed) = last {
            let cool_off = Duration::minutes(config.cool_off_mins() as i64);
            if now.signed_duration_since(completed) < cool_off {
                info!(
                    "stream {} scale {} deferred: previous action {} is inside the \
                     {}min cooldown",
                    self.policy.stream_name,
                    direction,
                    completed,
                    config.cool_off_mins()
                );
                self.emit(ScalingReport {
                    stream_name: self.policy.stream_name.clone(),
                    end_status: EndStatus::NoActionRequired,
                    direction,
                    operations_made: 0,
                    layout: OpenShardSet::new(),
                    message: Some("deferred by cooldown".to_string()),
                });
                return Ok(());
            }
        }

        let Some(by) = config.scale_by() else {
            warn!(
                "stream {} voted scale {} but the policy carries neither \
                 scaleCount nor scalePct",
                self.policy.stream_name, direction
            );
            return Ok(());
        };
        let caps = ShardCaps {
            min_shards: self.policy.min_shards,
            max_shards: self.policy.max_shards,
        };

        let stream = self.policy.stream_name.clone();
        let result = match direction {
            ScaleDirection::Up => self.scaler.scale_up(&stream, by, caps, true).await,
            _ => self.scaler.scale_down(&stream, by, caps, true).await,
        };

        match result {
            Ok(report) => {
                if report.end_status == EndStatus::Ok {
                    let completed = self.clock.now();
                    match direction {
                        ScaleDirection::Up => self.last_scale_up = Some(completed),
                        _ => self.last_scale_down = Some(completed),
                    }
                    self.refresh_capacity().await?;
                    self.notify(&config, &report).await;
                    info!("{}", report);
                } else {
                    // cap reached before any mutation: no cooldown update
                    info!(
                        "stream {} scale {} ended {} without mutating",
                        stream, direction, report.end_status
                    );
                }
                self.emit(report);
                Ok(())
            }
            Err(ScalingError::AlreadyOneShard(_)) => {
                info!(
                    "stream {} cannot scale down below a single shard",
                    stream
                );
                let layout = self.control.open_shard_set(&stream).await?;
                self.emit(ScalingReport {
                    stream_name: stream,
                    end_status: EndStatus::AlreadyAtMinimum,
                    direction,
                    operations_made: 0,
                    layout,
                    message: Some("stream already has a single shard".to_string()),
                });
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    async fn notify(&self, config: &ScalingConfig, report: &ScalingReport) {
        let Some(target) = &config.notification_target else {
            return;
        };
        let subject = report.notification_subject();
        if let Err(e) = self
            .notifier
            .publish(target, &subject, &report.to_json())
            .await
        {
            warn!(
                "notification for stream {} could not be published: {}",
                report.stream_name, e
            );
        }
    }

    async fn maybe_refresh_capacity(&mut self, now: DateTime<Utc>) -> ScalingResult<()> {
        let due = match self.last_capacity_refresh {
            None => true,
            Some(at) => {
                now.signed_duration_since(at)
                    >= Duration::minutes(self.policy.refresh_shards_after_mins as i64)
            }
        };
        if due {
            self.refresh_capacity().await?;
        }
        Ok(())
    }

    /// Reload the open-shard count and recompute capacity, absorbing any
    /// resize made outside this monitor
    async fn refresh_capacity(&mut self) -> ScalingResult<()> {
        let open = self
            .control
            .get_open_shard_count(&self.policy.stream_name)
            .await?;
        self.metrics.update_capacity(open);
        self.last_capacity_refresh = Some(self.clock.now());
        Ok(())
    }

    fn emit(&self, report: ScalingReport) {
        if let Some(tx) = &self.report_tx {
            let _ = tx.send(report);
        }
    }
}
