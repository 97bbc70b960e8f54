//! Kinesis Autoscaler Library
//!
//! Automatic and manual scaling for partitioned, hash-keyspace streams.
//! A topology engine rebalances the 128-bit keyspace across shards with
//! minimum mutation cost, and a metrics-driven controller votes over
//! capacity dimensions to grow and shrink each monitored stream.
//!
//! ## Features
//!
//! - **Keyspace-Aware Rebalancing**: splits and merges converge every open
//!   shard to a near-uniform share, one mutation in flight at a time
//! - **Metrics-Driven Decisions**: windowed byte and record utilisation per
//!   operation class, combined through a fixed vote matrix
//! - **Cooldowns and Caps**: per-direction cooldowns, min/max shard bounds
//! - **Atomic Fast Path**: provider-side resize preferred, split/merge
//!   fallback when the provider refuses
//! - **Capability-Style Clients**: AWS implementations plus an in-memory
//!   control plane for tests and dry runs

// Core scaling modules
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod hash_math;
pub mod kinesis;
pub mod metrics;
pub mod monitor;
pub mod report;
pub mod scaler;
pub mod shard;
pub mod topology;

// Re-export commonly used types
pub use config::{load_policies, ScalingConfig, StreamPolicy};
pub use controller::AutoscalingController;
pub use error::{ScalingError, ScalingResult};
pub use kinesis::{BackoffPolicy, StreamControl};
pub use metrics::{KinesisOperation, MetricsManager};
pub use monitor::StreamMonitor;
pub use report::{EndStatus, ScaleDirection, ScalingReport};
pub use scaler::{ScaleBy, Scaler, ShardCaps};
pub use shard::{OpenShardSet, ShardInfo};
pub use topology::TopologyEngine;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
