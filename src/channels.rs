use crate::config::MonitorConfig;
use crate::error::{TrackerError, TrackerResult};
use crate::types::{ChannelId, Point2};
use serde::Serialize;

/// Runtime state of one microphone
#[derive(Clone, Debug, Serialize)]
pub struct MicrophoneChannel {
    pub id: ChannelId,
    pub name: String,
    pub device: String,
    #[serde(skip)]
    pub position: Point2,
    /// Mean calibration level, `None` until calibrated or when no samples were valid
    pub noise_floor_db: Option<f64>,
    pub threshold_db: f64,
    /// Monotonic seconds of the last accepted detection (debounce reference)
    pub last_detection: Option<f64>,
}

/// Index-addressed table of the configured microphones.
#[derive(Clone, Debug)]
pub struct ChannelRegistry {
    channels: Vec<MicrophoneChannel>,
}

impl ChannelRegistry {
    pub fn from_config(config: &MonitorConfig) -> TrackerResult<Self> {
        config.validate()?;

        let channels = config
            .channels
            .iter()
            .map(|ch| MicrophoneChannel {
                id: ChannelId(ch.id),
                name: ch.name.clone(),
                device: ch.device.clone(),
                position: Point2::new(ch.x_mm, ch.y_mm),
                noise_floor_db: None,
                threshold_db: config.default_threshold_db,
                last_detection: None,
            })
            .collect();

        Ok(ChannelRegistry { channels })
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channels(&self) -> &[MicrophoneChannel] {
        &self.channels
    }

    pub fn iter(&self) -> impl Iterator<Item = &MicrophoneChannel> {
        self.channels.iter()
    }

    pub fn get(&self, id: ChannelId) -> Option<&MicrophoneChannel> {
        self.channels.iter().find(|ch| ch.id == id)
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut MicrophoneChannel> {
        self.channels.iter_mut().find(|ch| ch.id == id)
    }

    pub fn at_mut(&mut self, index: usize) -> Option<&mut MicrophoneChannel> {
        self.channels.get_mut(index)
    }

    pub fn name(&self, id: ChannelId) -> &str {
        self.get(id).map(|ch| ch.name.as_str()).unwrap_or("?")
    }

    /// Positions for the given ids, in the same order.
    pub fn positions(&self, ids: &[ChannelId]) -> TrackerResult<Vec<Point2>> {
        ids.iter()
            .map(|id| {
                self.get(*id)
                    .map(|ch| ch.position)
                    .ok_or_else(|| TrackerError::Config(format!("unknown channel id {}", id)))
            })
            .collect()
    }

    /// Record a calibration result: floor + margin, or the default when no floor was measured.
    pub fn set_noise_floor(
        &mut self,
        id: ChannelId,
        noise_floor_db: Option<f64>,
        margin_db: f64,
        default_threshold_db: f64,
    ) -> Option<f64> {
        let ch = self.get_mut(id)?;
        ch.noise_floor_db = noise_floor_db;
        ch.threshold_db = match noise_floor_db {
            Some(floor) => floor + margin_db,
            None => default_threshold_db,
        };
        Some(ch.threshold_db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_from_default_config() {
        let config = MonitorConfig::default();
        let registry = ChannelRegistry::from_config(&config).unwrap();

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.name(ChannelId(1)), "middle");
        for ch in registry.iter() {
            assert_eq!(ch.threshold_db, config.default_threshold_db);
            assert!(ch.noise_floor_db.is_none());
            assert!(ch.last_detection.is_none());
        }

        let positions = registry.positions(&[ChannelId(2), ChannelId(0)]).unwrap();
        assert_eq!(positions[0], Point2::new(300.0, 0.0));
        assert_eq!(positions[1], Point2::new(100.0, 0.0));
        assert!(registry.positions(&[ChannelId(9)]).is_err());
    }

    #[test]
    fn test_registry_refuses_single_channel() {
        let mut config = MonitorConfig::default();
        config.channels.truncate(1);
        assert!(ChannelRegistry::from_config(&config).is_err());
    }

    #[test]
    fn test_set_noise_floor() {
        let config = MonitorConfig::default();
        let mut registry = ChannelRegistry::from_config(&config).unwrap();

        let threshold = registry.set_noise_floor(ChannelId(0), Some(-52.0), 5.0, -20.0);
        assert_eq!(threshold, Some(-47.0));

        let threshold = registry.set_noise_floor(ChannelId(1), None, 5.0, -20.0);
        assert_eq!(threshold, Some(-20.0));

        assert_eq!(registry.set_noise_floor(ChannelId(7), None, 5.0, -20.0), None);
    }
}
