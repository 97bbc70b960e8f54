//! Scaling Error Types
//!
//! Typed failures for scaling actions. Cap conditions that merely stop an
//! action early (already at minimum or maximum) are not errors; they travel
//! in the report's end status.

use thiserror::Error;

use crate::kinesis::api::ControlError;

/// Result type alias for scaling operations
pub type ScalingResult<T> = Result<T, ScalingError>;

#[derive(Debug, Error)]
pub enum ScalingError {
    /// Configuration document violated a validation rule. Fatal at load time.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Scale-down was requested against a single-shard stream
    #[error("stream '{0}' has one shard and cannot scale down")]
    AlreadyOneShard(String),

    /// A requested target shard count was unusable
    #[error("invalid scaling target: {0}")]
    InvalidTarget(String),

    /// Post-mutation re-query could not identify the expected shards
    #[error("shard resolution failed: {0}")]
    ResolutionFailure(String),

    /// Control-plane failure that survived the retry policy
    #[error("control plane error: {0}")]
    Control(#[from] ControlError),

    /// Configuration not fetchable or not parseable at process start
    #[error("fatal startup failure: {0}")]
    FatalStartup(String),
}

impl ScalingError {
    pub fn invalid_configuration<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    pub fn resolution_failure<S: Into<String>>(message: S) -> Self {
        Self::ResolutionFailure(message.into())
    }
}
