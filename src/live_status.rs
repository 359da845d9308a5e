use crate::channels::ChannelRegistry;
use crate::error::TrackerResult;
use crate::health_monitor::HealthMonitor;
use crate::types::LocalizationEstimate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ChannelStatus {
    pub id: u8,
    pub name: String,
    pub noise_floor_db: Option<f64>,
    pub threshold_db: f64,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub silence_secs: Option<f64>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ImpactStatus {
    pub x_mm: f64,
    pub y_mm: f64,
    pub confidence: f64,
    pub residual: f64,
    /// Monotonic seconds since monitor start
    pub at: f64,
}

impl From<&LocalizationEstimate> for ImpactStatus {
    fn from(est: &LocalizationEstimate) -> Self {
        ImpactStatus {
            x_mm: est.x_mm,
            y_mm: est.y_mm,
            confidence: est.confidence,
            residual: est.residual,
            at: est.timestamp,
        }
    }
}

/// Snapshot rewritten to `live_status.json` while the monitor runs
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct LiveStatus {
    /// Unix seconds when the snapshot was taken
    pub timestamp: f64,
    pub state: String,
    pub uptime_seconds: f64,
    pub calibration_complete: bool,
    pub cycles: u64,
    pub detections: u64,
    pub estimates: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub failed_reads: u64,
    pub channels: Vec<ChannelStatus>,
    pub last_impact: Option<ImpactStatus>,
}

impl LiveStatus {
    pub fn new() -> Self {
        Self {
            timestamp: current_timestamp(),
            ..Default::default()
        }
    }

    /// Per-channel thresholds merged with health bookkeeping
    pub fn set_channels(&mut self, registry: &ChannelRegistry, health: &HealthMonitor, now: f64) {
        self.channels = registry
            .iter()
            .zip(health.channels())
            .map(|(ch, h)| ChannelStatus {
                id: ch.id.0,
                name: ch.name.clone(),
                noise_floor_db: ch.noise_floor_db,
                threshold_db: ch.threshold_db,
                healthy: h.healthy,
                consecutive_failures: h.consecutive_failures,
                silence_secs: h.silence_secs(now),
            })
            .collect();
    }

    pub fn save(&self, path: &Path) -> TrackerResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
