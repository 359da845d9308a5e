use crate::error::{TrackerError, TrackerResult};
use crate::types::Point2;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Longest period any timing field may take (s)
const MAX_PERIOD_SECS: f64 = 86_400.0;

/// Static description of one microphone.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: u8,
    pub name: String,
    /// Capture device handed to the backend (ALSA alias for sox)
    pub device: String,
    pub x_mm: f64,
    pub y_mm: f64,
}

impl ChannelConfig {
    pub fn new(id: u8, name: &str, device: &str, x_mm: f64, y_mm: f64) -> Self {
        ChannelConfig {
            id,
            name: name.to_string(),
            device: device.to_string(),
            x_mm,
            y_mm,
        }
    }
}

/// Axis-aligned rectangle of physically plausible impact positions (mm).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl BoundingBox {
    /// Inclusive on every edge
    pub fn contains(&self, p: &Point2) -> bool {
        (self.x_min..=self.x_max).contains(&p.x) && (self.y_min..=self.y_max).contains(&p.y)
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        BoundingBox {
            x_min: 0.0,
            x_max: 400.0,
            y_min: 0.0,
            y_max: 1000.0,
        }
    }
}

/// Nelder-Mead tuning
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Simplex size tolerance (mm)
    pub xatol: f64,
    /// Objective spread tolerance (s²)
    pub fatol: f64,
    pub max_iterations: usize,
    /// Initial step for a zero seed coordinate (mm)
    pub zero_step_mm: f64,
    /// Relative initial step for a non-zero seed coordinate
    pub relative_step: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            xatol: 1e-3,
            fatol: 1e-16,
            max_iterations: 400,
            zero_step_mm: 1.0,
            relative_step: 0.05,
        }
    }
}

/// Everything the monitor needs, immutable once validated.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub channels: Vec<ChannelConfig>,
    /// Propagation speed (mm/s); 343000 for air at ~20°C
    pub speed_of_sound_mm_s: f64,
    /// Analysis window per channel per cycle (s)
    pub window_secs: f64,
    pub cycle_period_secs: f64,
    /// Minimum time between two accepted detections on one channel (s)
    pub debounce_secs: f64,
    /// Span within which detections count as the same event; cycle period when unset
    pub coincidence_window_secs: Option<f64>,
    /// Threshold = noise floor + margin (dB)
    pub margin_db: f64,
    /// Threshold used when calibration gets no valid samples (dB)
    pub default_threshold_db: f64,
    /// Residual acceptance limit (s²); smaller is stricter
    pub residual_threshold: f64,
    pub bounds: BoundingBox,
    pub calibration_secs: f64,
    pub calibration_interval_secs: f64,
    /// Grace added to the window before a read counts as failed (s)
    pub capture_timeout_secs: f64,
    /// Full-scale amplitude that marks an impact onset inside a sample block
    pub onset_amplitude: f64,
    /// Consecutive failed reads before a channel is reported unhealthy
    pub unhealthy_after: u32,
    pub status_interval_secs: f64,
    pub solver: SolverConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            channels: vec![
                ChannelConfig::new(0, "left", "mic_3", 100.0, 0.0),
                ChannelConfig::new(1, "middle", "mic_2", 200.0, 0.0),
                ChannelConfig::new(2, "right", "mic_1", 300.0, 0.0),
            ],
            speed_of_sound_mm_s: 343_000.0,
            window_secs: 0.1,
            cycle_period_secs: 0.5,
            debounce_secs: 0.1,
            coincidence_window_secs: None,
            margin_db: 5.0,
            default_threshold_db: -20.0,
            residual_threshold: 0.00005,
            bounds: BoundingBox::default(),
            calibration_secs: 10.0,
            calibration_interval_secs: 1.0,
            capture_timeout_secs: 1.0,
            onset_amplitude: 0.1,
            unhealthy_after: 5,
            status_interval_secs: 2.0,
            solver: SolverConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Load a JSON config; missing fields take their defaults.
    pub fn load(path: &Path) -> TrackerResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: MonitorConfig = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs_f64(self.window_secs)
    }

    pub fn cycle_period(&self) -> Duration {
        Duration::from_secs_f64(self.cycle_period_secs)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.window_secs + self.capture_timeout_secs)
    }

    pub fn coincidence_window(&self) -> f64 {
        self.coincidence_window_secs.unwrap_or(self.cycle_period_secs)
    }

    /// Reject configurations the monitor cannot run with.
    pub fn validate(&self) -> TrackerResult<()> {
        if self.channels.len() < 2 {
            return Err(TrackerError::Config(format!(
                "at least 2 channels are required, got {}",
                self.channels.len()
            )));
        }

        let mut ids = HashSet::new();
        for ch in &self.channels {
            if !ids.insert(ch.id) {
                return Err(TrackerError::Config(format!("duplicate channel id {}", ch.id)));
            }
            if !ch.x_mm.is_finite() || !ch.y_mm.is_finite() {
                return Err(TrackerError::Config(format!(
                    "channel {} ({}) has a non-finite position",
                    ch.id, ch.name
                )));
            }
        }

        let positive = [
            ("speed_of_sound_mm_s", self.speed_of_sound_mm_s),
            ("window_secs", self.window_secs),
            ("cycle_period_secs", self.cycle_period_secs),
            ("calibration_interval_secs", self.calibration_interval_secs),
            ("residual_threshold", self.residual_threshold),
            ("status_interval_secs", self.status_interval_secs),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(TrackerError::Config(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }

        let non_negative = [
            ("debounce_secs", self.debounce_secs),
            ("calibration_secs", self.calibration_secs),
            ("capture_timeout_secs", self.capture_timeout_secs),
            ("coincidence_window_secs", self.coincidence_window()),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(TrackerError::Config(format!("{} must be >= 0, got {}", name, value)));
            }
        }

        let timing = [
            ("window_secs", self.window_secs),
            ("cycle_period_secs", self.cycle_period_secs),
            ("calibration_interval_secs", self.calibration_interval_secs),
            ("status_interval_secs", self.status_interval_secs),
            ("debounce_secs", self.debounce_secs),
            ("calibration_secs", self.calibration_secs),
            ("capture_timeout_secs", self.window_secs + self.capture_timeout_secs),
            ("coincidence_window_secs", self.coincidence_window()),
        ];
        for (name, value) in timing {
            if value > MAX_PERIOD_SECS {
                return Err(TrackerError::Config(format!(
                    "{} must be at most {}s, got {}",
                    name, MAX_PERIOD_SECS, value
                )));
            }
        }

        if !self.margin_db.is_finite() || !self.default_threshold_db.is_finite() {
            return Err(TrackerError::Config("threshold levels must be finite".to_string()));
        }

        let b = &self.bounds;
        if !(b.x_min <= b.x_max && b.y_min <= b.y_max) {
            return Err(TrackerError::Config(format!(
                "empty bounding box x {}..{} y {}..{}",
                b.x_min, b.x_max, b.y_min, b.y_max
            )));
        }

        if self.solver.max_iterations == 0 {
            return Err(TrackerError::Config("solver.max_iterations must be > 0".to_string()));
        }

        Ok(())
    }
}
