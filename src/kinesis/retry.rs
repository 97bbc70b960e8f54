//! Retry and Backoff Policy
//!
//! Wraps control-plane calls in a bounded retry loop. Transient "resource in
//! use" waits a fixed second; throttling backs off exponentially with a
//! per-sleep cap; everything else surfaces immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use super::api::ControlError;

/// Retry parameters for control-plane calls. A value, not behavior: the
/// loop in `with_retries` is the only interpreter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Total attempts per logical call
    pub max_attempts: u32,
    /// Fixed pause while the stream is mid-mutation
    pub resource_in_use_delay: Duration,
    /// Base of the throttling backoff (doubled per attempt)
    pub throttle_base: Duration,
    /// Upper bound for a single throttling sleep
    pub throttle_cap: Duration,
    /// Exponent cap so the shift never overflows
    pub throttle_exponent_cap: u32,
    /// First wait before polling stream status
    pub status_initial_wait: Duration,
    /// Poll interval for stream status thereafter
    pub status_poll_interval: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            resource_in_use_delay: Duration::from_secs(1),
            throttle_base: Duration::from_millis(100),
            throttle_cap: Duration::from_secs(2),
            throttle_exponent_cap: 20,
            status_initial_wait: Duration::from_secs(20),
            status_poll_interval: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    /// A policy with near-zero waits, for tests and the simulator
    pub fn fast() -> Self {
        Self {
            max_attempts: 10,
            resource_in_use_delay: Duration::from_millis(1),
            throttle_base: Duration::from_millis(1),
            throttle_cap: Duration::from_millis(5),
            throttle_exponent_cap: 20,
            status_initial_wait: Duration::from_millis(1),
            status_poll_interval: Duration::from_millis(1),
        }
    }

    /// Sleep for the given 1-based throttled attempt:
    /// `min(2^attempt * base, cap)`
    pub fn throttle_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(self.throttle_exponent_cap);
        let factor = 1u64 << exponent;
        self.throttle_base
            .saturating_mul(factor as u32)
            .min(self.throttle_cap)
    }
}

/// Run `call` under the policy. Retryable failures sleep and try again up to
/// `max_attempts`; non-retryable failures and exhausted retries return the
/// last error to the caller.
pub async fn with_retries<T, F, Fut>(
    policy: &BackoffPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, ControlError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ControlError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                if attempt >= policy.max_attempts {
                    warn!(
                        "{} failed after {} attempts: {}",
                        operation, attempt, err
                    );
                    return Err(err);
                }
                let delay = match &err {
                    ControlError::ResourceInUse(_) => policy.resource_in_use_delay,
                    _ => policy.throttle_delay(attempt).saturating_add(jitter()),
                };
                debug!(
                    "{} attempt {} failed ({}), retrying in {:?}",
                    operation, attempt, err, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Small random smear so concurrent monitors do not retry in lockstep
fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..25))
}
