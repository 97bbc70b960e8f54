//! Scaling Reports
//!
//! Every terminal scaling decision produces exactly one report: how the
//! action ended, which direction it moved, how many provider mutations it
//! took, and the resulting open-shard layout. Reports render both as text
//! for operators and as JSON for notification targets.

use serde::{Deserialize, Serialize};

use crate::shard::OpenShardSet;

/// Direction of a scaling decision or action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleDirection {
    Up,
    Down,
    None,
}

impl std::fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScaleDirection::Up => write!(f, "Up"),
            ScaleDirection::Down => write!(f, "Down"),
            ScaleDirection::None => write!(f, "None"),
        }
    }
}

/// How a scaling action terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndStatus {
    /// Informational run; nothing was mutated
    ReportOnly,
    /// The stream already matched the requested target
    NoActionRequired,
    /// The minimum shard cap was reached before any mutation
    AlreadyAtMinimum,
    /// The maximum shard cap was reached before any mutation
    AlreadyAtMaximum,
    /// The action failed; see the message
    Error,
    /// The action completed with at least one mutation
    Ok,
}

impl std::fmt::Display for EndStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            EndStatus::ReportOnly => "ReportOnly",
            EndStatus::NoActionRequired => "NoActionRequired",
            EndStatus::AlreadyAtMinimum => "AlreadyAtMinimum",
            EndStatus::AlreadyAtMaximum => "AlreadyAtMaximum",
            EndStatus::Error => "Error",
            EndStatus::Ok => "Ok",
        };
        write!(f, "{}", label)
    }
}

/// Outcome of one scaling action against one stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingReport {
    pub stream_name: String,
    pub end_status: EndStatus,
    pub direction: ScaleDirection,
    /// Provider mutations issued (splits, merges, or one atomic resize)
    pub operations_made: u32,
    /// Open-shard layout enumerated after the last successful mutation
    pub layout: OpenShardSet,
    /// Operator-facing detail, set on errors and deferrals
    pub message: Option<String>,
}

impl ScalingReport {
    /// Subject line used when publishing this action to a notification
    /// target
    pub fn notification_subject(&self) -> String {
        format!("Kinesis Autoscaling - Scale {}", self.direction)
    }

    /// Structured rendering for notification targets
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self)
            .unwrap_or_else(|e| format!("{{\"error\":\"unserializable report: {}\"}}", e))
    }
}

impl std::fmt::Display for ScalingReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Scaling {} on stream {}: {} ({} operation{})",
            self.direction,
            self.stream_name,
            self.end_status,
            self.operations_made,
            if self.operations_made == 1 { "" } else { "s" }
        )?;
        if let Some(message) = &self.message {
            writeln!(f, "  {}", message)?;
        }
        writeln!(f, "  open shards: {}", self.layout.len())?;
        for shard in self.layout.shards() {
            writeln!(
                f,
                "    {} [{} - {}] {:.4}%",
                shard.shard_id,
                shard.start_hash,
                shard.end_hash,
                shard.pct_width * 100.0
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::ShardInfo;

    fn sample_report() -> ScalingReport {
        let mut layout = OpenShardSet::new();
        layout
            .insert(ShardInfo::new("shardId-000000000001".into(), 0, u128::MAX))
            .unwrap();
        ScalingReport {
            stream_name: "orders".into(),
            end_status: EndStatus::Ok,
            direction: ScaleDirection::Up,
            operations_made: 3,
            layout,
            message: None,
        }
    }

    #[test]
    fn test_notification_subject() {
        let mut report = sample_report();
        assert_eq!(
            report.notification_subject(),
            "Kinesis Autoscaling - Scale Up"
        );
        report.direction = ScaleDirection::Down;
        assert_eq!(
            report.notification_subject(),
            "Kinesis Autoscaling - Scale Down"
        );
    }

    #[test]
    fn test_render_mentions_status_and_layout() {
        let report = sample_report();
        let text = report.to_string();
        assert!(text.contains("Ok"));
        assert!(text.contains("3 operations"));
        assert!(text.contains("shardId-000000000001"));
    }

    #[test]
    fn test_json_round_trip() {
        let report = sample_report();
        let back: ScalingReport = serde_json::from_str(&report.to_json()).unwrap();
        assert_eq!(back.end_status, EndStatus::Ok);
        assert_eq!(back.layout.len(), 1);
    }
}
