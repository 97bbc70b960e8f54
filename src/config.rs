//! Autoscaler Configuration
//!
//! This module decodes, defaults, and validates the JSON configuration
//! document driving the daemon: an array of per-stream policies. The
//! document handle resolves in order as an S3 object, an HTTP(S) URL with
//! tight timeouts, or a filesystem path.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ScalingError, ScalingResult};
use crate::metrics::KinesisOperation;
use crate::scaler::ScaleBy;

/// Connect/read timeout for HTTP configuration fetches
const HTTP_FETCH_TIMEOUT: Duration = Duration::from_secs(1);

/// Thresholds and sizing for one scaling direction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScalingConfig {
    /// Utilisation percentage that marks a sample high (scale-up) or low
    /// (scale-down)
    pub threshold_pct: u32,
    /// Consecutive qualifying minutes required before acting
    pub after_mins: u32,
    /// Minimum minutes between successful actions in this direction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cool_off_mins: Option<u32>,
    /// Shards to add or remove; dominates `scale_pct` when both are set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_count: Option<u64>,
    /// Percentage sizing in factor form (see the scaler)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_pct: Option<u32>,
    /// Notification target ARN for actions in this direction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_target: Option<String>,
}

impl ScalingConfig {
    pub fn cool_off_mins(&self) -> u32 {
        self.cool_off_mins.unwrap_or(0)
    }

    /// Sizing carried by this direction; count dominates percentage
    pub fn scale_by(&self) -> Option<ScaleBy> {
        if let Some(count) = self.scale_count {
            return Some(ScaleBy::Count(count));
        }
        self.scale_pct.map(ScaleBy::Pct)
    }
}

fn default_scale_on_operations() -> Vec<KinesisOperation> {
    vec![KinesisOperation::Put, KinesisOperation::Get]
}

fn default_refresh_shards_after_mins() -> u32 {
    10
}

fn default_check_interval_sec() -> u32 {
    45
}

/// Autoscaling policy for one stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamPolicy {
    pub stream_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Operation classes whose utilisation drives decisions
    #[serde(default = "default_scale_on_operations")]
    pub scale_on_operations: Vec<KinesisOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_shards: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_shards: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up: Option<ScalingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down: Option<ScalingConfig>,
    /// Minutes between cached-capacity reloads, absorbing manual resizes
    #[serde(default = "default_refresh_shards_after_mins")]
    pub refresh_shards_after_mins: u32,
    /// Seconds between monitor cycles
    #[serde(default = "default_check_interval_sec")]
    pub check_interval_sec: u32,
}

impl StreamPolicy {
    /// Enforce the invariants of one policy
    pub fn validate(&self) -> ScalingResult<()> {
        if self.stream_name.trim().is_empty() {
            return Err(ScalingError::invalid_configuration(
                "streamName must not be empty",
            ));
        }
        if self.scale_up.is_none() && self.scale_down.is_none() {
            return Err(ScalingError::invalid_configuration(format!(
                "stream {}: at least one of scaleUp or scaleDown is required",
                self.stream_name
            )));
        }
        if let Some(up) = &self.scale_up {
            if let Some(pct) = up.scale_pct {
                if pct <= 100 {
                    return Err(ScalingError::invalid_configuration(format!(
                        "stream {}: scaleUp.scalePct must be above 100 \
                         (the target factor in percent of current), got {}",
                        self.stream_name, pct
                    )));
                }
            }
        }
        if let Some(down) = &self.scale_down {
            if let Some(pct) = down.scale_pct {
                if pct >= 100 {
                    return Err(ScalingError::invalid_configuration(format!(
                        "stream {}: scaleDown.scalePct must be below 100 \
                         (the target factor in percent of current), got {}",
                        self.stream_name, pct
                    )));
                }
            }
        }
        if let (Some(min), Some(max)) = (self.min_shards, self.max_shards) {
            if min > max {
                return Err(ScalingError::invalid_configuration(format!(
                    "stream {}: minShards {} exceeds maxShards {}",
                    self.stream_name, min, max
                )));
            }
        }
        Ok(())
    }
}

/// Decode a configuration document and validate every policy
pub fn parse_policies(raw: &[u8]) -> ScalingResult<Vec<StreamPolicy>> {
    let policies: Vec<StreamPolicy> = serde_json::from_slice(raw)
        .map_err(|e| ScalingError::invalid_configuration(format!("bad document: {}", e)))?;
    if policies.is_empty() {
        return Err(ScalingError::invalid_configuration(
            "configuration document contains no stream policies",
        ));
    }
    for policy in &policies {
        policy.validate()?;
    }
    Ok(policies)
}

/// Fetch and decode the configuration document behind a URL-like handle.
/// `s3://bucket/key` reads through the object store, `http(s)://` fetches
/// with a one-second timeout, anything else is a filesystem path.
pub async fn load_policies(url: &str) -> ScalingResult<Vec<StreamPolicy>> {
    let raw = fetch_document(url).await?;
    let policies = parse_policies(&raw)?;
    info!(
        "loaded {} stream polic{} from {}",
        policies.len(),
        if policies.len() == 1 { "y" } else { "ies" },
        url
    );
    Ok(policies)
}

async fn fetch_document(url: &str) -> ScalingResult<Vec<u8>> {
    if let Some(rest) = url.strip_prefix("s3://") {
        let (bucket, key) = rest.split_once('/').ok_or_else(|| {
            ScalingError::FatalStartup(format!("malformed s3 url '{}'", url))
        })?;
        return crate::kinesis::aws::fetch_s3_object(bucket, key)
            .await
            .map_err(|e| {
                ScalingError::FatalStartup(format!("cannot fetch {}: {}", url, e))
            });
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        let client = reqwest::Client::builder()
            .connect_timeout(HTTP_FETCH_TIMEOUT)
            .timeout(HTTP_FETCH_TIMEOUT)
            .build()
            .map_err(|e| ScalingError::FatalStartup(e.to_string()))?;
        let response = client.get(url).send().await.map_err(|e| {
            ScalingError::FatalStartup(format!("cannot fetch {}: {}", url, e))
        })?;
        if !response.status().is_success() {
            return Err(ScalingError::FatalStartup(format!(
                "cannot fetch {}: HTTP {}",
                url,
                response.status()
            )));
        }
        let body = response.bytes().await.map_err(|e| {
            ScalingError::FatalStartup(format!("cannot read {}: {}", url, e))
        })?;
        return Ok(body.to_vec());
    }
    tokio::fs::read(url)
        .await
        .map_err(|e| ScalingError::FatalStartup(format!("cannot read {}: {}", url, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_policy_json() -> &'static str {
        r#"[{
            "streamName": "orders",
            "scaleUp": {"thresholdPct": 80, "afterMins": 5, "scalePct": 200},
            "scaleDown": {"thresholdPct": 20, "afterMins": 30, "scalePct": 50, "coolOffMins": 60}
        }]"#
    }

    #[test]
    fn test_parse_applies_defaults() {
        let policies = parse_policies(minimal_policy_json().as_bytes()).unwrap();
        let policy = &policies[0];
        assert_eq!(policy.stream_name, "orders");
        assert_eq!(
            policy.scale_on_operations,
            vec![KinesisOperation::Put, KinesisOperation::Get]
        );
        assert_eq!(policy.refresh_shards_after_mins, 10);
        assert_eq!(policy.check_interval_sec, 45);
        let up = policy.scale_up.as_ref().unwrap();
        assert_eq!(up.cool_off_mins(), 0);
        assert_eq!(up.scale_by(), Some(ScaleBy::Pct(200)));
        let down = policy.scale_down.as_ref().unwrap();
        assert_eq!(down.cool_off_mins(), 60);
    }

    #[test]
    fn test_scale_count_dominates_pct() {
        let config = ScalingConfig {
            threshold_pct: 80,
            after_mins: 5,
            cool_off_mins: None,
            scale_count: Some(3),
            scale_pct: Some(200),
            notification_target: None,
        };
        assert_eq!(config.scale_by(), Some(ScaleBy::Count(3)));
    }

    #[test]
    fn test_empty_stream_name_rejected() {
        let raw = r#"[{
            "streamName": " ",
            "scaleUp": {"thresholdPct": 80, "afterMins": 5, "scaleCount": 1}
        }]"#;
        let err = parse_policies(raw.as_bytes()).unwrap_err();
        assert!(matches!(err, ScalingError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_missing_both_directions_rejected() {
        let raw = r#"[{"streamName": "orders"}]"#;
        assert!(parse_policies(raw.as_bytes()).is_err());
    }

    #[test]
    fn test_scale_up_pct_must_exceed_100() {
        let raw = r#"[{
            "streamName": "orders",
            "scaleUp": {"thresholdPct": 80, "afterMins": 5, "scalePct": 90}
        }]"#;
        let err = parse_policies(raw.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("scaleUp.scalePct"));
    }

    #[test]
    fn test_scale_down_pct_must_be_below_100() {
        let raw = r#"[{
            "streamName": "orders",
            "scaleDown": {"thresholdPct": 20, "afterMins": 30, "scalePct": 120}
        }]"#;
        let err = parse_policies(raw.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("scaleDown.scalePct"));
    }

    #[test]
    fn test_min_above_max_rejected() {
        let raw = r#"[{
            "streamName": "orders",
            "minShards": 8,
            "maxShards": 4,
            "scaleUp": {"thresholdPct": 80, "afterMins": 5, "scaleCount": 1}
        }]"#;
        let err = parse_policies(raw.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("minShards"));
    }

    #[test]
    fn test_empty_document_rejected() {
        assert!(parse_policies(b"[]").is_err());
        assert!(parse_policies(b"{not json").is_err());
    }

    #[tokio::test]
    async fn test_load_from_filesystem_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(minimal_policy_json().as_bytes()).unwrap();
        let policies = load_policies(file.path().to_str().unwrap()).await.unwrap();
        assert_eq!(policies.len(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_fatal() {
        let err = load_policies("/definitely/not/here.json").await.unwrap_err();
        assert!(matches!(err, ScalingError::FatalStartup(_)));
    }
}
