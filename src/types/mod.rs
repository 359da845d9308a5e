pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable small-integer identity of a microphone channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u8);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One analysis window that crossed its channel's threshold.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub channel: ChannelId,
    /// Seconds on the monitor's shared monotonic clock
    pub timestamp: f64,
    pub level_db: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Arrival {
    pub channel: ChannelId,
    /// Seconds after the earliest detection in the set
    pub relative_time: f64,
}

/// Channels that heard the same event, relative to the earliest of them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArrivalSet {
    pub reference_channel: ChannelId,
    pub reference_time: f64,
    /// Sorted by channel id
    pub arrivals: Vec<Arrival>,
}

impl ArrivalSet {
    pub fn len(&self) -> usize {
        self.arrivals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrivals.is_empty()
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.arrivals.iter().map(|a| a.channel).collect()
    }

    pub fn relative_times(&self) -> Vec<f64> {
        self.arrivals.iter().map(|a| a.relative_time).collect()
    }
}

/// Why the gate refused an estimate
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    ResidualTooHigh,
    OutOfBounds,
    Both,
    SolverFailed,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Rejection::ResidualTooHigh => "residual too high",
            Rejection::OutOfBounds => "out of bounds",
            Rejection::Both => "residual too high and out of bounds",
            Rejection::SolverFailed => "no reliable solution",
        };
        f.write_str(text)
    }
}

/// Gated result of one multilateration attempt. Never mutated after creation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalizationEstimate {
    pub x_mm: f64,
    pub y_mm: f64,
    /// Objective value at the solution (s²); infinite when the solve failed
    pub residual: f64,
    pub confidence: f64,
    pub accepted: bool,
    pub rejection: Option<Rejection>,
    pub channels: Vec<ChannelId>,
    pub timestamp: f64,
}

impl LocalizationEstimate {
    pub fn position(&self) -> Point2 {
        Point2::new(self.x_mm, self.y_mm)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    NoDetection,
    Estimate,
}

/// Structured outcome of one monitoring cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CycleResult {
    pub status: CycleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<(f64, f64)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub residual: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contributing_channels: Option<Vec<ChannelId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
    pub detections: Vec<DetectionEvent>,
    pub timestamp: f64,
}

impl CycleResult {
    pub fn no_detection(detections: Vec<DetectionEvent>, timestamp: f64) -> Self {
        CycleResult {
            status: CycleStatus::NoDetection,
            position: None,
            residual: None,
            confidence: None,
            contributing_channels: None,
            accepted: None,
            rejection: None,
            detections,
            timestamp,
        }
    }

    pub fn from_estimate(estimate: &LocalizationEstimate, detections: Vec<DetectionEvent>) -> Self {
        CycleResult {
            status: CycleStatus::Estimate,
            position: (estimate.x_mm.is_finite() && estimate.y_mm.is_finite())
                .then_some((estimate.x_mm, estimate.y_mm)),
            residual: Some(estimate.residual),
            confidence: Some(estimate.confidence),
            contributing_channels: Some(estimate.channels.clone()),
            accepted: Some(estimate.accepted),
            rejection: estimate.rejection,
            detections,
            timestamp: estimate.timestamp,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_detection_serializes_without_estimate_fields() {
        let result = CycleResult::no_detection(Vec::new(), 1.5);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "no_detection");
        assert!(json.get("position").is_none());
        assert!(json.get("confidence").is_none());
        assert!(!result.is_accepted());
    }

    #[test]
    fn test_estimate_cycle_result() {
        let estimate = LocalizationEstimate {
            x_mm: 200.0,
            y_mm: 10.0,
            residual: 1e-9,
            confidence: 99.9,
            accepted: true,
            rejection: None,
            channels: vec![ChannelId(0), ChannelId(2)],
            timestamp: 3.0,
        };
        let result = CycleResult::from_estimate(&estimate, Vec::new());
        assert_eq!(result.status, CycleStatus::Estimate);
        assert!(result.is_accepted());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["contributing_channels"], serde_json::json!([0, 2]));
    }
}
