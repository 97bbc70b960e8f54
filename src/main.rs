//! Kinesis Autoscaler Daemon
//!
//! Loads the stream-policy configuration document, builds one monitor per
//! stream against the AWS clients, and supervises them until a child fails
//! or the host sends an interrupt.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use kinesis_autoscaler::clock::SystemClock;
use kinesis_autoscaler::kinesis::aws::{AwsMetricsApi, AwsNotifier, AwsStreamApi};
use kinesis_autoscaler::{
    load_policies, AutoscalingController, BackoffPolicy, StreamMonitor,
};

#[derive(Parser)]
#[command(name = "kinesis-autoscaler")]
#[command(about = "Metrics-driven autoscaling daemon for Kinesis streams")]
struct Cli {
    /// Configuration document handle: s3://bucket/key, http(s)://, or a
    /// filesystem path
    #[arg(long)]
    config_file_url: String,

    /// Stay alive on fatal startup errors instead of exiting non-zero
    #[arg(long, default_value_t = false)]
    suppress_abort_on_fatal: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli).await {
        error!("fatal: {:#}", e);
        if cli.suppress_abort_on_fatal {
            info!("abort suppressed by configuration, process staying alive");
            std::future::pending::<()>().await
        }
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let policies = load_policies(&cli.config_file_url).await?;

    let mut monitors = Vec::new();
    for policy in policies {
        let stream_api = AwsStreamApi::connect(policy.region.clone(), None).await?;
        let metrics_api = AwsMetricsApi::connect(policy.region.clone()).await;
        let notifier = AwsNotifier::connect(policy.region.clone()).await;
        monitors.push(StreamMonitor::new(
            policy,
            Arc::new(stream_api),
            Arc::new(metrics_api),
            Arc::new(notifier),
            Arc::new(SystemClock),
            BackoffPolicy::default(),
        ));
    }
    info!("autoscaler starting with {} monitor(s)", monitors.len());

    let mut controller = AutoscalingController::start(monitors);
    tokio::select! {
        result = controller.supervise() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, stopping monitors");
            controller.stop_all().await;
        }
    }
    Ok(())
}
