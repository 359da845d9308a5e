use crate::channels::MicrophoneChannel;
use crate::error::{TrackerError, TrackerResult};
use crate::shutdown::MonotonicClock;
use crate::solver::travel_time;
use crate::types::Point2;
use futures::future::join_all;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

/// Audio for one channel's analysis window
#[derive(Clone, Debug)]
pub enum CaptureBlock {
    /// Mono samples normalized to [-1, 1]
    Samples { samples: Vec<f32>, sample_rate: u32 },
    /// Level already computed by the backend
    Level { level_db: f64 },
}

#[derive(Clone, Debug)]
pub struct Capture {
    /// Block start on the shared monotonic clock (s)
    pub acquired_at: f64,
    pub block: CaptureBlock,
}

impl Capture {
    /// RMS level of the block (dBFS)
    pub fn level_db(&self) -> f64 {
        match &self.block {
            CaptureBlock::Samples { samples, .. } => crate::detector::level_db(samples),
            CaptureBlock::Level { level_db } => *level_db,
        }
    }
}

/// Source of fixed-duration audio blocks.
///
/// Implementations must stamp `acquired_at` with the clock they are handed so
/// every channel shares one time base.
pub trait AudioCapture: Send + Sync {
    fn capture(
        &self,
        channel: &MicrophoneChannel,
        window: Duration,
        clock: MonotonicClock,
    ) -> impl Future<Output = TrackerResult<Capture>> + Send;

    /// Release devices and child processes at shutdown
    fn release(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Read every channel concurrently; each read is bounded by `limit`.
///
/// All reads are issued before any is awaited.
pub async fn capture_round<C: AudioCapture>(
    capture: &C,
    channels: &[MicrophoneChannel],
    window: Duration,
    limit: Duration,
    clock: MonotonicClock,
) -> Vec<TrackerResult<Capture>> {
    let reads = channels.iter().map(|channel| async move {
        match timeout(limit, capture.capture(channel, window, clock)).await {
            Ok(result) => result,
            Err(_) => Err(TrackerError::Acquisition {
                channel: channel.id,
                reason: format!("no block within {:.2}s", limit.as_secs_f64()),
            }),
        }
    });
    join_all(reads).await
}

/// Level capture through `sox -t alsa <device> -n trim 0 <window> stat`.
pub struct SoxCapture {
    program: String,
}

impl SoxCapture {
    pub fn new() -> Self {
        Self::with_program("sox")
    }

    pub fn with_program(program: &str) -> Self {
        SoxCapture {
            program: program.to_string(),
        }
    }
}

impl Default for SoxCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioCapture for SoxCapture {
    async fn capture(
        &self,
        channel: &MicrophoneChannel,
        window: Duration,
        clock: MonotonicClock,
    ) -> TrackerResult<Capture> {
        let acquired_at = clock.now_secs();
        let output = Command::new(&self.program)
            .arg("-q")
            .arg("-t")
            .arg("alsa")
            .arg(&channel.device)
            .arg("-n")
            .arg("trim")
            .arg("0")
            .arg(format!("{:.3}", window.as_secs_f64()))
            .arg("stat")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| TrackerError::Acquisition {
                channel: channel.id,
                reason: format!("failed to run {}: {}", self.program, e),
            })?;

        // sox writes its report to stderr
        let report = String::from_utf8_lossy(&output.stderr);
        let level_db = crate::detector::parse_rms_report(&report).ok_or_else(|| {
            TrackerError::Acquisition {
                channel: channel.id,
                reason: format!(
                    "no RMS level in sox output (status {}): {}",
                    output.status,
                    report.lines().next().unwrap_or("")
                ),
            }
        })?;

        Ok(Capture {
            acquired_at,
            block: CaptureBlock::Level { level_db },
        })
    }

    async fn release(&self) {
        // children are per-read and killed on drop
        info!("sox capture released");
    }
}

/// Synthetic impacts from a fixed source, for demos and bench runs
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub source_x_mm: f64,
    pub source_y_mm: f64,
    pub speed_of_sound_mm_s: f64,
    pub sample_rate: u32,
    /// Every Nth block per channel carries an impact
    pub impact_every: u64,
    /// Emission time after block start (s)
    pub impact_offset_secs: f64,
    pub impact_amplitude: f32,
    pub noise_amplitude: f32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            source_x_mm: 220.0,
            source_y_mm: 400.0,
            speed_of_sound_mm_s: 343_000.0,
            sample_rate: 48_000,
            impact_every: 6,
            impact_offset_secs: 0.01,
            impact_amplitude: 0.8,
            noise_amplitude: 0.002,
        }
    }
}

pub struct SimulatedCapture {
    config: SimulationConfig,
    positions: HashMap<u8, Point2>,
    blocks: Mutex<HashMap<u8, u64>>,
}

impl SimulatedCapture {
    pub fn new(config: SimulationConfig, channels: &[MicrophoneChannel]) -> Self {
        let positions = channels.iter().map(|ch| (ch.id.0, ch.position)).collect();
        SimulatedCapture {
            config,
            positions,
            blocks: Mutex::new(HashMap::new()),
        }
    }

    fn next_block_index(&self, id: u8) -> u64 {
        let mut blocks = match self.blocks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let counter = blocks.entry(id).or_insert(0);
        let index = *counter;
        *counter += 1;
        index
    }

    /// Block of low-level noise, plus a decaying impulse when `arrival` falls inside it
    pub fn synthesize(
        &self,
        id: u8,
        block_index: u64,
        len: usize,
        arrival: Option<f64>,
    ) -> Vec<f32> {
        let cfg = &self.config;
        let phase = id as f64 * 1.3 + block_index as f64 * 0.7;
        let mut samples: Vec<f32> = (0..len)
            .map(|i| {
                let t = i as f64 * 0.37 + phase;
                (cfg.noise_amplitude as f64 * (t.sin() * 0.6 + (t * 2.9).cos() * 0.4)) as f32
            })
            .collect();

        if let Some(arrival) = arrival {
            let start = (arrival * cfg.sample_rate as f64).round() as usize;
            let decay = cfg.sample_rate as f64 * 0.008;
            for (k, s) in samples.iter_mut().enumerate().skip(start) {
                let n = (k - start) as f64;
                let envelope = (-n / decay).exp();
                let sign = if (k - start) % 2 == 0 { 1.0 } else { -1.0 };
                *s += (cfg.impact_amplitude as f64 * envelope * sign) as f32;
            }
        }
        samples
    }
}

impl AudioCapture for SimulatedCapture {
    async fn capture(
        &self,
        channel: &MicrophoneChannel,
        window: Duration,
        clock: MonotonicClock,
    ) -> TrackerResult<Capture> {
        let acquired_at = clock.now_secs();
        let id = channel.id.0;
        let position = *self.positions.get(&id).ok_or_else(|| TrackerError::Acquisition {
            channel: channel.id,
            reason: "channel not known to simulator".to_string(),
        })?;

        let block_index = self.next_block_index(id);
        let len = (window.as_secs_f64() * self.config.sample_rate as f64).round() as usize;

        let impact = self.config.impact_every > 0
            && block_index % self.config.impact_every == self.config.impact_every - 1;
        let arrival = if impact {
            let source = Point2::new(self.config.source_x_mm, self.config.source_y_mm);
            let travel = travel_time(&source, &position, self.config.speed_of_sound_mm_s);
            debug!("sim impact on {} travels {:.6}s", channel.name, travel);
            Some(self.config.impact_offset_secs + travel)
        } else {
            None
        };

        let samples = self.synthesize(id, block_index, len, arrival);
        Ok(Capture {
            acquired_at,
            block: CaptureBlock::Samples {
                samples,
                sample_rate: self.config.sample_rate,
            },
        })
    }
}
