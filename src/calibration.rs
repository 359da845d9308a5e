use crate::capture::{capture_round, AudioCapture};
use crate::channels::ChannelRegistry;
use crate::config::MonitorConfig;
use crate::shutdown::{MonotonicClock, ShutdownToken};
use crate::types::ChannelId;
use log::{info, warn};
use serde::Serialize;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Calibration outcome for one channel
#[derive(Clone, Debug, Serialize)]
pub struct ChannelCalibration {
    pub channel: ChannelId,
    pub name: String,
    pub samples: usize,
    pub noise_floor_db: Option<f64>,
    pub threshold_db: f64,
    /// True when no valid sample was collected and the default threshold applies
    pub defaulted: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct CalibrationReport {
    pub rounds: usize,
    pub cancelled: bool,
    pub channels: Vec<ChannelCalibration>,
}

/// Measures each channel's ambient level and derives its detection threshold.
pub struct NoiseFloorCalibrator {
    duration_secs: f64,
    interval: Duration,
    margin_db: f64,
    default_threshold_db: f64,
}

impl NoiseFloorCalibrator {
    pub fn new(
        duration_secs: f64,
        interval: Duration,
        margin_db: f64,
        default_threshold_db: f64,
    ) -> Self {
        Self {
            duration_secs,
            interval,
            margin_db,
            default_threshold_db,
        }
    }

    pub fn from_config(config: &MonitorConfig) -> Self {
        Self::new(
            config.calibration_secs,
            Duration::from_secs_f64(config.calibration_interval_secs),
            config.margin_db,
            config.default_threshold_db,
        )
    }

    /// Sampling rounds in the calibration period, at least one unless the period is zero
    pub fn rounds(&self) -> usize {
        if self.duration_secs <= 0.0 || self.interval.is_zero() {
            return 0;
        }
        ((self.duration_secs / self.interval.as_secs_f64()).floor() as usize).max(1)
    }

    /// Set every channel's floor and threshold from collected levels.
    ///
    /// `levels[i]` holds the readings of the registry's i-th channel; non-finite
    /// readings are ignored.
    pub fn apply(
        &self,
        registry: &mut ChannelRegistry,
        levels: &[Vec<f64>],
    ) -> Vec<ChannelCalibration> {
        let ids: Vec<(ChannelId, String)> =
            registry.iter().map(|ch| (ch.id, ch.name.clone())).collect();
        let mut results = Vec::with_capacity(ids.len());

        for (index, (id, name)) in ids.into_iter().enumerate() {
            let valid: Vec<f64> = levels
                .get(index)
                .map(|l| l.iter().copied().filter(|v| v.is_finite()).collect())
                .unwrap_or_default();

            let noise_floor_db = if valid.is_empty() {
                None
            } else {
                Some(valid.iter().sum::<f64>() / valid.len() as f64)
            };
            let threshold_db = registry
                .set_noise_floor(id, noise_floor_db, self.margin_db, self.default_threshold_db)
                .unwrap_or(self.default_threshold_db);

            match noise_floor_db {
                Some(floor) => info!(
                    "{}: noise floor {:.1} dB, threshold {:.1} dB ({} samples)",
                    name,
                    floor,
                    threshold_db,
                    valid.len()
                ),
                None => warn!(
                    "{}: no valid calibration samples, using default threshold {:.1} dB",
                    name, threshold_db
                ),
            }

            results.push(ChannelCalibration {
                channel: id,
                name,
                samples: valid.len(),
                noise_floor_db,
                threshold_db,
                defaulted: noise_floor_db.is_none(),
            });
        }
        results
    }

    /// Sample every channel once per interval for the calibration period.
    ///
    /// Cancellation ends sampling early; thresholds are still set from what was
    /// collected so far.
    pub async fn run<C: AudioCapture>(
        &self,
        registry: &mut ChannelRegistry,
        capture: &C,
        clock: MonotonicClock,
        window: Duration,
        limit: Duration,
        shutdown: &ShutdownToken,
    ) -> CalibrationReport {
        let planned = self.rounds();
        info!(
            "Calibrating noise floor over {:.1}s ({} rounds)...",
            self.duration_secs, planned
        );

        let mut levels: Vec<Vec<f64>> = vec![Vec::with_capacity(planned); registry.len()];
        let mut ticker = interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut rounds = 0;
        let mut cancelled = false;
        while rounds < planned {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    cancelled = true;
                    break;
                }
                _ = ticker.tick() => {}
            }

            let results = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    cancelled = true;
                    break;
                }
                results = capture_round(capture, registry.channels(), window, limit, clock) => {
                    results
                }
            };

            for (index, result) in results.into_iter().enumerate() {
                match result {
                    Ok(block) => levels[index].push(block.level_db()),
                    Err(e) => warn!("calibration read skipped: {}", e),
                }
            }
            rounds += 1;
        }

        if cancelled {
            warn!("Calibration interrupted after {} of {} rounds", rounds, planned);
        }

        CalibrationReport {
            rounds,
            cancelled,
            channels: self.apply(registry, &levels),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Capture, CaptureBlock};
    use crate::channels::MicrophoneChannel;
    use crate::error::{TrackerError, TrackerResult};
    use crate::shutdown::shutdown_channel;
    use approx::assert_abs_diff_eq;
    use tokio::time::sleep;

    /// Fixed level per channel; channel 2 always fails
    struct QuietRoom;

    impl AudioCapture for QuietRoom {
        async fn capture(
            &self,
            channel: &MicrophoneChannel,
            _window: Duration,
            clock: MonotonicClock,
        ) -> TrackerResult<Capture> {
            if channel.id.0 == 2 {
                return Err(TrackerError::Acquisition {
                    channel: channel.id,
                    reason: "device unplugged".to_string(),
                });
            }
            Ok(Capture {
                acquired_at: clock.now_secs(),
                block: CaptureBlock::Level {
                    level_db: -50.0 - channel.id.0 as f64 * 4.0,
                },
            })
        }
    }

    fn calibrator(duration: f64) -> NoiseFloorCalibrator {
        NoiseFloorCalibrator::new(duration, Duration::from_secs(1), 5.0, -20.0)
    }

    #[test]
    fn test_rounds() {
        assert_eq!(calibrator(10.0).rounds(), 10);
        assert_eq!(calibrator(0.4).rounds(), 1);
        assert_eq!(calibrator(0.0).rounds(), 0);
    }

    #[test]
    fn test_apply_mean_plus_margin() {
        let mut registry = ChannelRegistry::from_config(&MonitorConfig::default()).unwrap();
        let levels = vec![vec![-52.0, -48.0], vec![f64::NAN, -60.0], vec![]];

        let results = calibrator(10.0).apply(&mut registry, &levels);

        assert_abs_diff_eq!(results[0].noise_floor_db.unwrap(), -50.0, epsilon = 1e-12);
        assert_abs_diff_eq!(results[0].threshold_db, -45.0, epsilon = 1e-12);
        assert_eq!(results[1].samples, 1);
        assert_abs_diff_eq!(results[1].threshold_db, -55.0, epsilon = 1e-12);
        assert!(results[2].defaulted);
        assert_eq!(results[2].threshold_db, -20.0);

        assert_eq!(registry.channels()[0].threshold_db, -45.0);
        assert_eq!(registry.channels()[2].noise_floor_db, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_collects_and_defaults_failed_channel() {
        let mut registry = ChannelRegistry::from_config(&MonitorConfig::default()).unwrap();
        let (_trigger, token) = shutdown_channel();

        let report = calibrator(3.0)
            .run(
                &mut registry,
                &QuietRoom,
                MonotonicClock::start(),
                Duration::from_millis(100),
                Duration::from_millis(1100),
                &token,
            )
            .await;

        assert_eq!(report.rounds, 3);
        assert!(!report.cancelled);
        assert_eq!(report.channels[0].samples, 3);
        assert_abs_diff_eq!(report.channels[1].threshold_db, -49.0, epsilon = 1e-12);
        assert!(report.channels[2].defaulted);
        assert_eq!(registry.channels()[2].threshold_db, -20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_keeps_partial_means() {
        let mut registry = ChannelRegistry::from_config(&MonitorConfig::default()).unwrap();
        let (trigger, token) = shutdown_channel();
        tokio::spawn(async move {
            sleep(Duration::from_millis(2500)).await;
            trigger.fire();
        });

        let report = calibrator(10.0)
            .run(
                &mut registry,
                &QuietRoom,
                MonotonicClock::start(),
                Duration::from_millis(100),
                Duration::from_millis(1100),
                &token,
            )
            .await;

        assert!(report.cancelled);
        assert_eq!(report.rounds, 3);
        assert_eq!(report.channels[0].samples, 3);
        assert_eq!(report.channels[1].samples, 3);
        assert_abs_diff_eq!(report.channels[0].noise_floor_db.unwrap(), -50.0, epsilon = 1e-12);
        assert_abs_diff_eq!(report.channels[0].threshold_db, -45.0, epsilon = 1e-12);
        assert_abs_diff_eq!(report.channels[1].threshold_db, -49.0, epsilon = 1e-12);
        assert!(report.channels[2].defaulted);
        assert_eq!(registry.channels()[1].threshold_db, -49.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let mut registry = ChannelRegistry::from_config(&MonitorConfig::default()).unwrap();
        let (trigger, token) = shutdown_channel();
        trigger.fire();

        let report = calibrator(10.0)
            .run(
                &mut registry,
                &QuietRoom,
                MonotonicClock::start(),
                Duration::from_millis(100),
                Duration::from_millis(1100),
                &token,
            )
            .await;

        assert!(report.cancelled);
        assert_eq!(report.rounds, 0);
        assert!(report.channels.iter().all(|c| c.defaulted));
    }
}
