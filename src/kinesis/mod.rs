//! Kinesis Control-Plane Access
//!
//! Capability traits over the external stream service plus the retry-wrapped
//! shim the rest of the crate talks to. The `aws` module binds the traits to
//! the real SDK clients; `sim` provides the in-memory control plane used by
//! integration tests and local experiments.

pub mod api;
pub mod aws;
pub mod control;
pub mod retry;
pub mod sim;

pub use api::{ControlError, StreamApi, StreamStatus, StreamSummary};
pub use control::StreamControl;
pub use retry::BackoffPolicy;
