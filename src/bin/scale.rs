//! Manual Scaling CLI
//!
//! One-shot scaling actions against a stream: grow or shrink by count or
//! percentage, resize to an exact count, split or merge a single shard, or
//! print the current layout. Output is the rendered scaling report; the
//! process exits non-zero on failure.

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};

use kinesis_autoscaler::kinesis::aws::AwsStreamApi;
use kinesis_autoscaler::{BackoffPolicy, ScaleBy, Scaler, ShardCaps, StreamControl};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ScalingAction {
    #[value(name = "scaleUp")]
    ScaleUp,
    #[value(name = "scaleDown")]
    ScaleDown,
    #[value(name = "resize")]
    Resize,
    #[value(name = "report")]
    Report,
}

#[derive(Parser)]
#[command(name = "kinesis-scale")]
#[command(about = "Manually scale a Kinesis stream or report its layout")]
struct Cli {
    #[arg(long)]
    stream_name: String,

    #[arg(long, value_enum)]
    scaling_action: ScalingAction,

    /// Shards to add/remove (scaleUp/scaleDown), the exact target (resize),
    /// or the piece count for a targeted shard split
    #[arg(long)]
    count: Option<u64>,

    /// Percentage form: above 100 on scaleUp grows to that factor of the
    /// current count, at or below 100 adds that share of it; the mirror
    /// rules apply on scaleDown
    #[arg(long)]
    pct: Option<u32>,

    #[arg(long)]
    region: Option<String>,

    /// Endpoint override for local stacks
    #[arg(long)]
    kinesis_endpoint: Option<String>,

    /// Operate on one shard only: split it (scaleUp) or merge it with its
    /// neighbour (scaleDown)
    #[arg(long)]
    shard_id: Option<String>,

    #[arg(long)]
    min_shards: Option<u64>,

    #[arg(long)]
    max_shards: Option<u64>,

    /// Block until the stream returns to ACTIVE after each mutation
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    wait_for_completion: bool,
}

impl Cli {
    fn validate(&self) -> Result<()> {
        match self.scaling_action {
            ScalingAction::Report => {
                if self.count.is_some() || self.pct.is_some() {
                    bail!("report does not accept --count or --pct");
                }
            }
            ScalingAction::Resize => {
                if self.pct.is_some() {
                    bail!("resize does not accept --pct, use --count");
                }
                if self.count.is_none() {
                    bail!("resize requires --count");
                }
            }
            ScalingAction::ScaleUp | ScalingAction::ScaleDown => {
                if self.count.is_some() == self.pct.is_some() {
                    bail!("exactly one of --count or --pct is required");
                }
            }
        }
        if self.shard_id.is_some() {
            if !matches!(
                self.scaling_action,
                ScalingAction::ScaleUp | ScalingAction::ScaleDown
            ) {
                bail!("--shard-id is only valid with scaleUp or scaleDown");
            }
            if self.pct.is_some() {
                bail!("--shard-id does not accept --pct");
            }
        }
        Ok(())
    }

    fn scale_by(&self) -> Result<ScaleBy> {
        match (self.count, self.pct) {
            (Some(count), _) => Ok(ScaleBy::Count(count)),
            (None, Some(pct)) => Ok(ScaleBy::Pct(pct)),
            (None, None) => bail!("exactly one of --count or --pct is required"),
        }
    }

    fn caps(&self) -> ShardCaps {
        ShardCaps {
            min_shards: self.min_shards,
            max_shards: self.max_shards,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    cli.validate()?;

    let api = AwsStreamApi::connect(cli.region.clone(), cli.kinesis_endpoint.clone()).await?;
    let control = StreamControl::new(Arc::new(api), BackoffPolicy::default());
    let scaler = Scaler::new(control);

    let stream = cli.stream_name.as_str();
    let report = match (cli.scaling_action, cli.shard_id.as_deref()) {
        (ScalingAction::Report, _) => scaler.report(stream).await?,
        (ScalingAction::Resize, _) => {
            let count = cli.count.unwrap_or_default();
            scaler
                .resize(stream, count, cli.caps(), cli.wait_for_completion)
                .await?
        }
        (ScalingAction::ScaleUp, Some(shard_id)) => {
            let pieces = cli.count.unwrap_or_default();
            scaler
                .scale_up_shard(stream, shard_id, pieces, cli.caps())
                .await?
        }
        (ScalingAction::ScaleDown, Some(shard_id)) => {
            scaler.scale_down_shard(stream, shard_id, cli.caps()).await?
        }
        (ScalingAction::ScaleUp, None) => {
            scaler
                .scale_up(stream, cli.scale_by()?, cli.caps(), cli.wait_for_completion)
                .await?
        }
        (ScalingAction::ScaleDown, None) => {
            scaler
                .scale_down(stream, cli.scale_by()?, cli.caps(), cli.wait_for_completion)
                .await?
        }
    };

    println!("{}", report);
    Ok(())
}
