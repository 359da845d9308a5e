use crate::capture::{Capture, CaptureBlock};
use crate::channels::MicrophoneChannel;
use crate::types::DetectionEvent;

/// Level reported for a block with zero RMS
pub const SILENCE_DB: f64 = -100.0;

pub fn rms(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt()
}

/// Linear full-scale amplitude to dBFS, silence mapped to [`SILENCE_DB`]
pub fn amplitude_to_db(amplitude: f64) -> f64 {
    if amplitude > 0.0 {
        (20.0 * amplitude.log10()).max(SILENCE_DB)
    } else {
        SILENCE_DB
    }
}

pub fn level_db(samples: &[f32]) -> f64 {
    amplitude_to_db(rms(samples))
}

/// Parse the RMS level out of a sox `stat` or `stats` report.
///
/// `stat` prints `RMS     amplitude:     0.001234` (linear, converted here),
/// `stats` prints `RMS lev dB     -52.31` (already dB).
pub fn parse_rms_report(report: &str) -> Option<f64> {
    for line in report.lines() {
        let line = line.trim();
        if line.starts_with("RMS lev dB") {
            return line.split_whitespace().last()?.parse().ok();
        }
        if line.starts_with("RMS") && line.contains("amplitude") {
            let amplitude: f64 = line.split_whitespace().last()?.parse().ok()?;
            return Some(amplitude_to_db(amplitude));
        }
    }
    None
}

/// Offset (s) of the first sample whose magnitude reaches `threshold`.
pub fn onset_offset(samples: &[f32], sample_rate: u32, threshold: f64) -> Option<f64> {
    if sample_rate == 0 {
        return None;
    }
    samples
        .iter()
        .position(|&s| (s as f64).abs() >= threshold)
        .map(|idx| idx as f64 / sample_rate as f64)
}

/// Level of one channel's analysis window and the event it produced, if any
#[derive(Clone, Debug)]
pub struct LevelReading {
    pub level_db: f64,
    pub crossed: bool,
    pub event: Option<DetectionEvent>,
}

/// Threshold comparison with per-channel debounce.
///
/// The debounce reference is the channel's `last_detection`, which only this
/// detector writes.
pub struct EnergyDetector {
    debounce_secs: f64,
    onset_amplitude: f64,
}

impl EnergyDetector {
    pub fn new(debounce_secs: f64, onset_amplitude: f64) -> Self {
        Self {
            debounce_secs,
            onset_amplitude,
        }
    }

    /// Compare a level against the channel threshold at `timestamp`.
    ///
    /// Returns an event only for a crossing outside the debounce interval.
    pub fn evaluate(
        &self,
        channel: &mut MicrophoneChannel,
        level_db: f64,
        timestamp: f64,
    ) -> Option<DetectionEvent> {
        if !(level_db > channel.threshold_db) {
            return None;
        }

        if let Some(last) = channel.last_detection {
            if timestamp - last < self.debounce_secs {
                return None;
            }
        }

        channel.last_detection = Some(timestamp);
        Some(DetectionEvent {
            channel: channel.id,
            timestamp,
            level_db,
        })
    }

    /// Level and detection for one captured block.
    ///
    /// Sample blocks are timestamped at their impact onset when one is found.
    pub fn analyze(&self, channel: &mut MicrophoneChannel, capture: &Capture) -> LevelReading {
        let level_db = capture.level_db();
        let timestamp = match &capture.block {
            CaptureBlock::Samples {
                samples,
                sample_rate,
            } => {
                capture.acquired_at
                    + onset_offset(samples, *sample_rate, self.onset_amplitude).unwrap_or(0.0)
            }
            CaptureBlock::Level { .. } => capture.acquired_at,
        };

        let crossed = level_db > channel.threshold_db;
        let event = self.evaluate(channel, level_db, timestamp);
        LevelReading {
            level_db,
            crossed,
            event,
        }
    }
}
