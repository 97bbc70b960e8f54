//! Autoscaling Controller
//!
//! Process-wide supervisor owned by the host binary: spawns one worker per
//! configured stream policy, polls their health once a minute, and tears the
//! whole set down when any worker fails or the host signals shutdown. The
//! worker pool is exactly as wide as the policy list.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{ScalingError, ScalingResult};
use crate::monitor::StreamMonitor;

/// Interval between child-health checks
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(60);

struct Worker {
    stream_name: String,
    handle: JoinHandle<ScalingResult<()>>,
}

/// Supervisor over one monitor per stream policy
pub struct AutoscalingController {
    workers: Vec<Worker>,
    shutdown_tx: watch::Sender<bool>,
    health_poll: Duration,
}

impl AutoscalingController {
    /// Spawn every monitor immediately and return the running controller
    pub fn start(monitors: Vec<StreamMonitor>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let workers = monitors
            .into_iter()
            .map(|monitor| {
                let stream_name = monitor.stream_name().to_string();
                let shutdown_rx = shutdown_tx.subscribe();
                info!("starting worker for stream {}", stream_name);
                Worker {
                    stream_name,
                    handle: tokio::spawn(monitor.run(shutdown_rx)),
                }
            })
            .collect();
        AutoscalingController {
            workers,
            shutdown_tx,
            health_poll: HEALTH_POLL_INTERVAL,
        }
    }

    /// Shrink the health-poll interval, for tests
    pub fn with_health_poll(mut self, interval: Duration) -> Self {
        self.health_poll = interval;
        self
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Watch the workers until one of them exits, then stop the rest. An
    /// early worker exit is always a failure: healthy monitors only return
    /// after a shutdown signal.
    pub async fn supervise(&mut self) -> ScalingResult<()> {
        let mut ticker = tokio::time::interval(self.health_poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if self.workers.is_empty() {
                return Ok(());
            }
            let finished: Vec<&Worker> = self
                .workers
                .iter()
                .filter(|w| w.handle.is_finished())
                .collect();
            if finished.is_empty() {
                continue;
            }
            let failed: Vec<String> = finished
                .iter()
                .map(|w| w.stream_name.clone())
                .collect();
            warn!(
                "worker(s) for stream(s) {} exited early, stopping all monitors",
                failed.join(", ")
            );
            self.stop_all().await;
            return Err(ScalingError::FatalStartup(format!(
                "monitor worker(s) exited early: {}",
                failed.join(", ")
            )));
        }
    }

    /// Signal every monitor to stop and join them all
    pub async fn stop_all(&mut self) {
        info!("stopping {} monitor worker(s)", self.workers.len());
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers.drain(..) {
            match worker.handle.await {
                Ok(Ok(())) => info!("worker for stream {} stopped", worker.stream_name),
                Ok(Err(e)) => error!(
                    "worker for stream {} exited with error: {}",
                    worker.stream_name, e
                ),
                Err(join_err) => error!(
                    "worker for stream {} panicked: {}",
                    worker.stream_name, join_err
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::{ScalingConfig, StreamPolicy};
    use crate::kinesis::retry::BackoffPolicy;
    use crate::kinesis::sim::{SimKinesis, SimMetrics, SimNotifier};
    use crate::metrics::KinesisOperation;
    use std::sync::Arc;

    fn test_policy(stream: &str) -> StreamPolicy {
        StreamPolicy {
            stream_name: stream.to_string(),
            region: None,
            scale_on_operations: vec![KinesisOperation::Put],
            min_shards: None,
            max_shards: None,
            scale_up: Some(ScalingConfig {
                threshold_pct: 80,
                after_mins: 5,
                cool_off_mins: None,
                scale_count: Some(1),
                scale_pct: None,
                notification_target: None,
            }),
            scale_down: None,
            refresh_shards_after_mins: 10,
            check_interval_sec: 1,
        }
    }

    fn monitor_for(sim: &Arc<SimKinesis>, stream: &str) -> StreamMonitor {
        StreamMonitor::new(
            test_policy(stream),
            sim.clone(),
            Arc::new(SimMetrics::new()),
            Arc::new(SimNotifier::new()),
            Arc::new(SystemClock),
            BackoffPolicy::fast(),
        )
    }

    #[tokio::test]
    async fn test_one_worker_per_policy_and_clean_shutdown() {
        let sim = Arc::new(SimKinesis::new());
        sim.create_stream("orders", 2);
        sim.create_stream("payments", 2);

        let monitors = vec![monitor_for(&sim, "orders"), monitor_for(&sim, "payments")];
        let mut controller = AutoscalingController::start(monitors);
        assert_eq!(controller.worker_count(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.stop_all().await;
        assert_eq!(controller.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_worker_stops_the_rest() {
        let sim = Arc::new(SimKinesis::new());
        sim.create_stream("orders", 2);
        // the second stream does not exist, so its monitor dies on its
        // first capacity load
        let monitors = vec![monitor_for(&sim, "orders"), monitor_for(&sim, "ghost")];
        let mut controller = AutoscalingController::start(monitors)
            .with_health_poll(Duration::from_millis(20));

        let result = controller.supervise().await;
        assert!(result.is_err());
        assert_eq!(controller.worker_count(), 0);
    }
}
