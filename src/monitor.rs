use crate::aggregator::CoincidenceAggregator;
use crate::calibration::{ChannelCalibration, NoiseFloorCalibrator};
use crate::capture::{capture_round, AudioCapture, Capture};
use crate::channels::ChannelRegistry;
use crate::config::MonitorConfig;
use crate::detector::EnergyDetector;
use crate::error::{TrackerError, TrackerResult};
use crate::gate::ImpactGate;
use crate::health_monitor::{HealthMonitor, HealthTransition};
use crate::live_status::{ImpactStatus, LiveStatus};
use crate::report::Reporter;
use crate::shutdown::{MonotonicClock, ShutdownToken};
use crate::solver::MultilaterationSolver;
use crate::types::{CycleResult, LocalizationEstimate};
use chrono::Local;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::time::{interval, MissedTickBehavior};

/// Monitor lifecycle. Calibrating -> Monitoring -> ShuttingDown, never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorState {
    /// Measuring noise floors
    Calibrating,
    /// Capture/detect/localize cycles
    Monitoring,
    /// Cancellation observed; releasing resources
    ShuttingDown,
}

impl MonitorState {
    pub fn can_transition_to(self, next: MonitorState) -> bool {
        matches!(
            (self, next),
            (MonitorState::Calibrating, MonitorState::Monitoring)
                | (MonitorState::Monitoring, MonitorState::ShuttingDown)
        )
    }

    pub fn transition(self, next: MonitorState) -> TrackerResult<MonitorState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TrackerError::InvalidState(format!("{} -> {}", self, next)))
        }
    }
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Running counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub cycles: u64,
    pub detections: u64,
    pub estimates: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub failed_reads: u64,
}

/// Returned when the monitor shuts down
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: String,
    pub ended_at: String,
    pub uptime_secs: f64,
    pub stats: RunStats,
    pub calibration: Vec<ChannelCalibration>,
    pub accepted: Vec<LocalizationEstimate>,
    pub log_file: Option<String>,
}

pub struct Monitor<C: AudioCapture> {
    config: MonitorConfig,
    registry: ChannelRegistry,
    capture: C,
    calibrator: NoiseFloorCalibrator,
    detector: EnergyDetector,
    aggregator: CoincidenceAggregator,
    solver: MultilaterationSolver,
    gate: ImpactGate,
    health: HealthMonitor,
    reporter: Reporter,
    clock: MonotonicClock,
    state: MonitorState,
    stats: RunStats,
    calibration: Vec<ChannelCalibration>,
    accepted: Vec<LocalizationEstimate>,
    status_dir: Option<PathBuf>,
}

impl<C: AudioCapture> Monitor<C> {
    /// Build every component from a validated config. Fails on an invalid config.
    pub fn new(config: MonitorConfig, capture: C, reporter: Reporter) -> TrackerResult<Self> {
        let registry = ChannelRegistry::from_config(&config)?;
        let health = HealthMonitor::new(&registry, config.unhealthy_after);

        Ok(Monitor {
            calibrator: NoiseFloorCalibrator::from_config(&config),
            detector: EnergyDetector::new(config.debounce_secs, config.onset_amplitude),
            aggregator: CoincidenceAggregator::new(config.coincidence_window()),
            solver: MultilaterationSolver::from_config(&config),
            gate: ImpactGate::from_config(&config),
            registry,
            health,
            capture,
            reporter,
            clock: MonotonicClock::start(),
            state: MonitorState::Calibrating,
            stats: RunStats::default(),
            calibration: Vec::new(),
            accepted: Vec::new(),
            status_dir: None,
            config,
        })
    }

    /// Write `live_status.json` / `live_status_final.json` into `dir`
    pub fn with_status_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.status_dir = Some(dir.into());
        self
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    fn transition(&mut self, next: MonitorState) -> TrackerResult<()> {
        self.state = self.state.transition(next)?;
        info!("Monitor state: {}", self.state);
        Ok(())
    }

    fn channel_name(&self, index: usize) -> String {
        self.registry
            .channels()
            .get(index)
            .map(|ch| ch.name.clone())
            .unwrap_or_else(|| index.to_string())
    }

    fn log_event(&mut self, message: &str) {
        if let Err(e) = self.reporter.event(message) {
            warn!("Failed to write session log: {}", e);
        }
    }

    /// Calibrate, then run cycles until `shutdown` fires.
    pub async fn run(&mut self, shutdown: ShutdownToken) -> TrackerResult<RunSummary> {
        let started_at = Local::now();
        let window = self.config.window();
        let limit = self.config.capture_timeout();

        self.log_event(&format!(
            "Calibrating noise floor for {:.1}s on {} channels...",
            self.config.calibration_secs,
            self.registry.len()
        ));
        let report = self
            .calibrator
            .run(&mut self.registry, &self.capture, self.clock, window, limit, &shutdown)
            .await;
        for ch in &report.channels {
            let line = match ch.noise_floor_db {
                Some(floor) => format!(
                    "{}: noise floor {:.1} dB, threshold {:.1} dB",
                    ch.name, floor, ch.threshold_db
                ),
                None => format!(
                    "{}: no calibration data, default threshold {:.1} dB",
                    ch.name, ch.threshold_db
                ),
            };
            self.log_event(&line);
        }
        self.calibration = report.channels;

        self.transition(MonitorState::Monitoring)?;
        self.log_event("Monitoring started");
        self.write_status("live_status.json");

        let mut ticker = interval(self.config.cycle_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_status = self.clock.now_secs();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // in-flight reads are dropped on cancellation
            let results = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                results = capture_round(
                    &self.capture,
                    self.registry.channels(),
                    window,
                    limit,
                    self.clock,
                ) => results,
            };

            if let Err(e) = self.process_captures(results) {
                warn!("cycle {} failed: {}", self.stats.cycles, e);
            }

            let now = self.clock.now_secs();
            if now - last_status >= self.config.status_interval_secs {
                self.write_status("live_status.json");
                debug!("{}", self.health.format_status(now));
                last_status = now;
            }
        }

        self.transition(MonitorState::ShuttingDown)?;
        Ok(self.shutdown(started_at).await)
    }

    /// One capture/detect/localize cycle outside the timed loop
    pub async fn run_cycle(&mut self) -> TrackerResult<CycleResult> {
        let results = capture_round(
            &self.capture,
            self.registry.channels(),
            self.config.window(),
            self.config.capture_timeout(),
            self.clock,
        )
        .await;
        self.process_captures(results)
    }

    /// Detect, aggregate, solve, gate and report one round of captures.
    ///
    /// `results[i]` belongs to the registry's i-th channel.
    pub fn process_captures(
        &mut self,
        results: Vec<TrackerResult<Capture>>,
    ) -> TrackerResult<CycleResult> {
        self.stats.cycles += 1;
        let mut events = Vec::new();
        let mut states = Vec::with_capacity(results.len());

        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(capture) => {
                    if let Some(HealthTransition::Recovered) =
                        self.health.record_success(index, capture.acquired_at)
                    {
                        let message = format!("{}: capture recovered", self.channel_name(index));
                        self.log_event(&message);
                    }
                    let Some(channel) = self.registry.at_mut(index) else {
                        continue;
                    };
                    let reading = self.detector.analyze(channel, &capture);
                    states.push(u8::from(reading.crossed));
                    events.extend(reading.event);
                }
                Err(e) => {
                    self.stats.failed_reads += 1;
                    states.push(0);
                    warn!("{}", e);
                    if let Some(HealthTransition::BecameUnhealthy) =
                        self.health.record_failure(index)
                    {
                        let message =
                            format!("{}: capture failing repeatedly", self.channel_name(index));
                        self.log_event(&message);
                    }
                }
            }
        }

        debug!("Mic states: {:?}", states);
        self.stats.detections += events.len() as u64;

        let Some(set) = self.aggregator.aggregate(&events) else {
            if !events.is_empty() {
                debug!("{} detection(s), not enough for a location", events.len());
            }
            return Ok(CycleResult::no_detection(events, self.clock.now_secs()));
        };

        let channels = set.channels();
        let positions = self.registry.positions(&channels)?;
        let solution = self.solver.solve(&positions, &set.relative_times());
        let estimate = self.gate.evaluate(solution, channels, set.reference_time);

        self.stats.estimates += 1;
        if estimate.accepted {
            self.stats.accepted += 1;
            self.accepted.push(estimate.clone());
        } else {
            self.stats.rejected += 1;
            if let Some(reason) = estimate.rejection {
                info!("Estimate rejected: {}", reason);
            }
        }

        let result = CycleResult::from_estimate(&estimate, events);
        if let Err(e) = self.reporter.report_cycle(&result, &self.registry) {
            warn!("Failed to write session log: {}", e);
        }
        Ok(result)
    }

    fn live_status(&self) -> LiveStatus {
        let now = self.clock.now_secs();
        let mut status = LiveStatus::new();
        status.state = self.state.to_string();
        status.uptime_seconds = now;
        status.calibration_complete = self.state != MonitorState::Calibrating;
        status.cycles = self.stats.cycles;
        status.detections = self.stats.detections;
        status.estimates = self.stats.estimates;
        status.accepted = self.stats.accepted;
        status.rejected = self.stats.rejected;
        status.failed_reads = self.stats.failed_reads;
        status.set_channels(&self.registry, &self.health, now);
        status.last_impact = self.accepted.last().map(ImpactStatus::from);
        status
    }

    fn write_status(&self, file_name: &str) {
        let Some(dir) = &self.status_dir else {
            return;
        };
        if let Err(e) = self.live_status().save(&dir.join(file_name)) {
            warn!("Failed to write {}: {}", file_name, e);
        }
    }

    async fn shutdown(&mut self, started_at: chrono::DateTime<Local>) -> RunSummary {
        self.capture.release().await;

        self.log_event(&format!(
            "Monitoring stopped after {} cycles: {} accepted, {} rejected",
            self.stats.cycles, self.stats.accepted, self.stats.rejected
        ));
        if let Err(e) = self.reporter.flush() {
            warn!("Failed to flush session log: {}", e);
        }
        self.write_status("live_status_final.json");

        RunSummary {
            started_at: started_at.to_rfc3339(),
            ended_at: Local::now().to_rfc3339(),
            uptime_secs: self.clock.now_secs(),
            stats: self.stats.clone(),
            calibration: self.calibration.clone(),
            accepted: self.accepted.clone(),
            log_file: self.reporter.path().map(|p| p.display().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureBlock;
    use crate::channels::MicrophoneChannel;
    use crate::config::{BoundingBox, ChannelConfig};
    use crate::shutdown::{shutdown_channel, ShutdownTrigger};
    use crate::solver::travel_time;
    use crate::types::{CycleStatus, Point2, Rejection};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio::time::{sleep, Duration, Instant};

    const SAMPLE_RATE: u32 = 1_000_000;
    const BLOCK_LEN: usize = 2_000;
    const EMISSION_OFFSET: f64 = 100e-6;

    fn triangle_config() -> MonitorConfig {
        MonitorConfig {
            channels: vec![
                ChannelConfig::new(0, "a", "hw:0", 0.0, 0.0),
                ChannelConfig::new(1, "b", "hw:1", 500.0, 0.0),
                ChannelConfig::new(2, "c", "hw:2", 250.0, 1000.0),
            ],
            bounds: BoundingBox {
                x_min: 0.0,
                x_max: 500.0,
                y_min: 0.0,
                y_max: 1000.0,
            },
            calibration_secs: 0.0,
            ..MonitorConfig::default()
        }
    }

    fn block(onset: Option<f64>) -> Vec<f32> {
        let start = onset.map(|t| (t * SAMPLE_RATE as f64).round() as usize);
        (0..BLOCK_LEN)
            .map(|i| match start {
                Some(s) if i >= s => 0.9,
                _ => 0.001,
            })
            .collect()
    }

    /// Plays a fixed number of rounds, impacts at the listed rounds, then fires the trigger
    struct ScriptedCapture {
        source: Point2,
        positions: HashMap<u8, Point2>,
        impact_rounds: Vec<usize>,
        total_rounds: usize,
        counters: Mutex<HashMap<u8, usize>>,
        trigger: ShutdownTrigger,
    }

    impl AudioCapture for ScriptedCapture {
        async fn capture(
            &self,
            channel: &MicrophoneChannel,
            _window: Duration,
            clock: MonotonicClock,
        ) -> TrackerResult<Capture> {
            let acquired_at = clock.now_secs();
            let round = {
                let mut counters = self.counters.lock().unwrap();
                let counter = counters.entry(channel.id.0).or_insert(0);
                let round = *counter;
                *counter += 1;
                round
            };
            if round + 1 >= self.total_rounds {
                self.trigger.fire();
            }

            let onset = self.impact_rounds.contains(&round).then(|| {
                let mic = &self.positions[&channel.id.0];
                EMISSION_OFFSET + travel_time(&self.source, mic, 343_000.0)
            });
            Ok(Capture {
                acquired_at,
                block: CaptureBlock::Samples {
                    samples: block(onset),
                    sample_rate: SAMPLE_RATE,
                },
            })
        }
    }

    fn level(acquired_at: f64, level_db: f64) -> TrackerResult<Capture> {
        Ok(Capture {
            acquired_at,
            block: CaptureBlock::Level { level_db },
        })
    }

    struct NullCapture;

    impl AudioCapture for NullCapture {
        async fn capture(
            &self,
            channel: &MicrophoneChannel,
            _window: Duration,
            _clock: MonotonicClock,
        ) -> TrackerResult<Capture> {
            Err(TrackerError::Acquisition {
                channel: channel.id,
                reason: "no device".to_string(),
            })
        }
    }

    /// Reads never complete; records whether the devices were released
    #[derive(Default)]
    struct StalledCapture {
        released: AtomicBool,
    }

    impl AudioCapture for StalledCapture {
        async fn capture(
            &self,
            _channel: &MicrophoneChannel,
            _window: Duration,
            _clock: MonotonicClock,
        ) -> TrackerResult<Capture> {
            std::future::pending().await
        }

        async fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn quiet() -> Reporter {
        Reporter::console().quiet()
    }

    fn fire_after(trigger: ShutdownTrigger, delay: Duration) {
        tokio::spawn(async move {
            sleep(delay).await;
            trigger.fire();
        });
    }

    #[test]
    fn test_state_transitions() {
        use MonitorState::*;
        assert!(Calibrating.can_transition_to(Monitoring));
        assert!(Monitoring.can_transition_to(ShuttingDown));
        assert!(!Monitoring.can_transition_to(Calibrating));
        assert!(!ShuttingDown.can_transition_to(Calibrating));
        assert!(!Calibrating.can_transition_to(ShuttingDown));

        assert_eq!(Calibrating.transition(Monitoring).unwrap(), Monitoring);
        assert!(matches!(
            ShuttingDown.transition(Monitoring),
            Err(TrackerError::InvalidState(_))
        ));
    }

    #[test]
    fn test_invalid_config_refused() {
        let mut config = MonitorConfig::default();
        config.channels.truncate(1);
        assert!(Monitor::new(config, NullCapture, quiet()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_locates_scripted_impact() {
        let config = triangle_config();
        let (trigger, token) = shutdown_channel();
        let source = Point2::new(300.0, 400.0);
        let capture = ScriptedCapture {
            source,
            positions: config
                .channels
                .iter()
                .map(|c| (c.id, Point2::new(c.x_mm, c.y_mm)))
                .collect(),
            impact_rounds: vec![2],
            total_rounds: 5,
            counters: Mutex::new(HashMap::new()),
            trigger,
        };

        let dir = tempfile::tempdir().unwrap();
        let reporter = Reporter::create(dir.path()).unwrap().quiet();
        let mut monitor = Monitor::new(config, capture, reporter)
            .unwrap()
            .with_status_dir(dir.path());

        let summary = monitor.run(token).await.unwrap();

        assert_eq!(monitor.state(), MonitorState::ShuttingDown);
        assert_eq!(summary.stats.cycles, 5);
        assert_eq!(summary.stats.accepted, 1);
        assert_eq!(summary.stats.rejected, 0);
        assert!(summary.calibration.iter().all(|c| c.defaulted));

        let hit = &summary.accepted[0];
        assert!((hit.position() - source).norm() < 5.0);
        assert!(hit.confidence > 99.0);
        assert_eq!(hit.channels.len(), 3);

        assert!(dir.path().join("live_status_final.json").exists());
        let log = std::fs::read_to_string(summary.log_file.unwrap()).unwrap();
        assert!(log.contains("Impact detected at"));
        assert!(log.contains("Monitoring stopped after 5 cycles"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_start() {
        let (trigger, token) = shutdown_channel();
        trigger.fire();
        let mut monitor = Monitor::new(MonitorConfig::default(), NullCapture, quiet()).unwrap();

        let summary = monitor.run(token).await.unwrap();
        assert_eq!(monitor.state(), MonitorState::ShuttingDown);
        assert_eq!(summary.stats, RunStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_stalled_capture() {
        let mut config = triangle_config();
        config.capture_timeout_secs = 3600.0;
        let (trigger, token) = shutdown_channel();
        fire_after(trigger, Duration::from_millis(50));

        let mut monitor = Monitor::new(config, StalledCapture::default(), quiet()).unwrap();
        let started = Instant::now();
        let summary = monitor.run(token).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(monitor.state(), MonitorState::ShuttingDown);
        assert_eq!(summary.stats.cycles, 0);
        assert!(monitor.capture.released.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_status_rewritten_while_monitoring() {
        let config = triangle_config();
        let (trigger, token) = shutdown_channel();
        fire_after(trigger, Duration::from_millis(5200));

        let dir = tempfile::tempdir().unwrap();
        let mut monitor = Monitor::new(config, NullCapture, quiet())
            .unwrap()
            .with_status_dir(dir.path());
        let summary = monitor.run(token).await.unwrap();

        let text = std::fs::read_to_string(dir.path().join("live_status.json")).unwrap();
        let status: LiveStatus = serde_json::from_str(&text).unwrap();
        assert_eq!(status.state, "Monitoring");
        assert!(status.cycles > 0);
        assert!(status.cycles < summary.stats.cycles);
        assert_eq!(status.failed_reads, status.cycles * 3);

        let text = std::fs::read_to_string(dir.path().join("live_status_final.json")).unwrap();
        let last: LiveStatus = serde_json::from_str(&text).unwrap();
        assert_eq!(last.state, "ShuttingDown");
        assert_eq!(last.cycles, summary.stats.cycles);
    }

    #[tokio::test]
    async fn test_reverberation_within_debounce_ignored() {
        let config = triangle_config();
        let mut monitor = Monitor::new(config, NullCapture, quiet()).unwrap();

        let first = monitor
            .process_captures(vec![level(1.0, -5.0), level(1.0003, -5.0), level(1.0004, -5.0)])
            .unwrap();
        assert_eq!(first.status, CycleStatus::Estimate);

        let echo = monitor
            .process_captures(vec![level(1.05, -8.0), level(1.0503, -8.0), level(1.0504, -8.0)])
            .unwrap();
        assert_eq!(echo.status, CycleStatus::NoDetection);
        assert!(echo.detections.is_empty());
        assert_eq!(monitor.stats().detections, 3);
    }

    #[tokio::test]
    async fn test_single_channel_detection_is_no_impact() {
        let mut monitor = Monitor::new(MonitorConfig::default(), NullCapture, quiet()).unwrap();
        let result = monitor
            .process_captures(vec![level(2.0, -60.0), level(2.0, -3.0), level(2.0, -60.0)])
            .unwrap();
        assert_eq!(result.status, CycleStatus::NoDetection);
        assert_eq!(result.detections.len(), 1);
        assert_eq!(monitor.stats().estimates, 0);
    }

    #[tokio::test]
    async fn test_left_and_right_only_rejected_gracefully() {
        let mut monitor = Monitor::new(MonitorConfig::default(), NullCapture, quiet()).unwrap();
        let result = monitor
            .process_captures(vec![level(3.0, -10.0), level(3.0, -60.0), level(3.01, -10.0)])
            .unwrap();

        assert_eq!(result.status, CycleStatus::Estimate);
        assert!(!result.is_accepted());
        assert_eq!(result.confidence, Some(0.0));
        assert!(matches!(
            result.rejection,
            Some(Rejection::ResidualTooHigh) | Some(Rejection::Both) | Some(Rejection::SolverFailed)
        ));
        assert_eq!(monitor.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_failed_reads_counted_and_health_tracked() {
        let mut config = MonitorConfig::default();
        config.unhealthy_after = 2;
        let mut monitor = Monitor::new(config, NullCapture, quiet()).unwrap();

        for _ in 0..2 {
            let result = monitor.run_cycle().await.unwrap();
            assert_eq!(result.status, CycleStatus::NoDetection);
        }
        assert_eq!(monitor.stats().failed_reads, 6);
        assert!(!monitor.health.is_healthy(0));
    }
}
