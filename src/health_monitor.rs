use crate::channels::ChannelRegistry;
use crate::types::ChannelId;
use log::{info, warn};
use serde::Serialize;

/// Read-failure bookkeeping for one channel
#[derive(Clone, Debug, Serialize)]
pub struct ChannelHealth {
    pub channel: ChannelId,
    pub name: String,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    /// Monotonic seconds of the last good block
    pub last_ok: Option<f64>,
    pub healthy: bool,
}

impl ChannelHealth {
    pub fn new(channel: ChannelId, name: &str) -> Self {
        ChannelHealth {
            channel,
            name: name.to_string(),
            consecutive_failures: 0,
            total_failures: 0,
            last_ok: None,
            healthy: true,
        }
    }

    pub fn silence_secs(&self, now: f64) -> Option<f64> {
        self.last_ok.map(|t| (now - t).max(0.0))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthTransition {
    BecameUnhealthy,
    Recovered,
}

/// Tracks consecutive acquisition failures per channel
pub struct HealthMonitor {
    channels: Vec<ChannelHealth>,
    unhealthy_after: u32,
}

impl HealthMonitor {
    pub fn new(registry: &ChannelRegistry, unhealthy_after: u32) -> Self {
        HealthMonitor {
            channels: registry
                .iter()
                .map(|ch| ChannelHealth::new(ch.id, &ch.name))
                .collect(),
            unhealthy_after: unhealthy_after.max(1),
        }
    }

    pub fn channels(&self) -> &[ChannelHealth] {
        &self.channels
    }

    pub fn is_healthy(&self, index: usize) -> bool {
        self.channels.get(index).map(|h| h.healthy).unwrap_or(false)
    }

    /// Record a good block for the channel at `index`
    pub fn record_success(&mut self, index: usize, now: f64) -> Option<HealthTransition> {
        let health = self.channels.get_mut(index)?;
        health.consecutive_failures = 0;
        health.last_ok = Some(now);
        if health.healthy {
            return None;
        }
        health.healthy = true;
        info!("[HEALTH] {} recovered", health.name);
        Some(HealthTransition::Recovered)
    }

    /// Record a failed read; reports the transition once when the limit is reached
    pub fn record_failure(&mut self, index: usize) -> Option<HealthTransition> {
        let health = self.channels.get_mut(index)?;
        health.consecutive_failures += 1;
        health.total_failures += 1;
        if !health.healthy || health.consecutive_failures < self.unhealthy_after {
            return None;
        }
        health.healthy = false;
        warn!(
            "[HEALTH] {} unhealthy after {} consecutive failed reads",
            health.name, health.consecutive_failures
        );
        Some(HealthTransition::BecameUnhealthy)
    }

    /// Format health status for logging
    pub fn format_status(&self, now: f64) -> String {
        let parts: Vec<String> = self
            .channels
            .iter()
            .map(|h| {
                if h.healthy {
                    format!("{} ✓", h.name)
                } else {
                    match h.silence_secs(now) {
                        Some(secs) => format!("{} ⚠ (silent {:.1}s)", h.name, secs),
                        None => format!("{} ⚠ (no data)", h.name),
                    }
                }
            })
            .collect();
        format!("Health: {}", parts.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;

    fn monitor(limit: u32) -> HealthMonitor {
        let registry = ChannelRegistry::from_config(&MonitorConfig::default()).unwrap();
        HealthMonitor::new(&registry, limit)
    }

    #[test]
    fn test_starts_healthy() {
        let health = monitor(5);
        assert!((0..3).all(|i| health.is_healthy(i)));
        assert!(!health.is_healthy(9));
        assert_eq!(health.format_status(0.0), "Health: left ✓ | middle ✓ | right ✓");
    }

    #[test]
    fn test_unhealthy_reported_once() {
        let mut health = monitor(3);
        assert_eq!(health.record_success(1, 1.0), None);

        assert_eq!(health.record_failure(1), None);
        assert_eq!(health.record_failure(1), None);
        assert_eq!(health.record_failure(1), Some(HealthTransition::BecameUnhealthy));
        assert_eq!(health.record_failure(1), None);
        assert!(!health.is_healthy(1));
        assert_eq!(health.channels()[1].total_failures, 4);

        let status = health.format_status(4.5);
        assert!(status.contains("middle ⚠ (silent 3.5s)"));
    }

    #[test]
    fn test_recovery() {
        let mut health = monitor(1);
        assert_eq!(health.record_failure(0), Some(HealthTransition::BecameUnhealthy));
        assert!(health.format_status(1.0).contains("left ⚠ (no data)"));

        assert_eq!(health.record_success(0, 2.0), Some(HealthTransition::Recovered));
        assert_eq!(health.channels()[0].consecutive_failures, 0);
        assert!(health.is_healthy(0));
    }

    #[test]
    fn test_failures_reset_by_success() {
        let mut health = monitor(2);
        health.record_failure(2);
        health.record_success(2, 1.0);
        assert_eq!(health.record_failure(2), None);
        assert!(health.is_healthy(2));
    }
}
