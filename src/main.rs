use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, ValueEnum};
use impact_tracker_rs::capture::{AudioCapture, SimulatedCapture, SimulationConfig, SoxCapture};
use impact_tracker_rs::channels::ChannelRegistry;
use impact_tracker_rs::config::MonitorConfig;
use impact_tracker_rs::monitor::{Monitor, RunSummary};
use impact_tracker_rs::report::Reporter;
use impact_tracker_rs::shutdown::{shutdown_channel, ShutdownTrigger};
use std::path::{Path, PathBuf};
use tokio::time::{sleep, Duration};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backend {
    /// ALSA devices through `sox`
    Sox,
    /// Synthetic impacts from a fixed source
    Simulated,
}

#[derive(Parser, Debug)]
#[command(name = "impact_tracker")]
#[command(about = "Acoustic impact detection and localization", long_about = None)]
struct Args {
    /// Duration in seconds (0 = continuous)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// JSON config file; missing fields take defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output directory
    #[arg(long, default_value = "impact_sessions")]
    output_dir: String,

    /// Capture backend
    #[arg(long, value_enum, default_value = "sox")]
    backend: Backend,

    /// Calibration period in seconds
    #[arg(long)]
    calibration_secs: Option<f64>,

    /// Detection margin above the noise floor (dB)
    #[arg(long)]
    margin_db: Option<f64>,

    /// Residual acceptance threshold (s²)
    #[arg(long)]
    residual_threshold: Option<f64>,

    /// Cycle period in seconds
    #[arg(long)]
    cycle_period: Option<f64>,

    /// Simulated source x (mm)
    #[arg(long, default_value = "220.0")]
    sim_x: f64,

    /// Simulated source y (mm)
    #[arg(long, default_value = "400.0")]
    sim_y: f64,
}

impl Args {
    fn monitor_config(&self) -> Result<MonitorConfig> {
        let mut config = match &self.config {
            Some(path) => MonitorConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => MonitorConfig::default(),
        };
        if let Some(v) = self.calibration_secs {
            config.calibration_secs = v;
        }
        if let Some(v) = self.margin_db {
            config.margin_db = v;
        }
        if let Some(v) = self.residual_threshold {
            config.residual_threshold = v;
        }
        if let Some(v) = self.cycle_period {
            config.cycle_period_secs = v;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = args.monitor_config()?;

    println!("[{}] Impact Tracker Starting", ts_now());
    println!("  Duration: {} seconds (0=continuous)", args.duration);
    println!("  Backend: {:?}", args.backend);
    println!("  Channels: {}", config.channels.len());
    for ch in &config.channels {
        println!("    {} ({}) at ({:.0}, {:.0}) mm", ch.name, ch.device, ch.x_mm, ch.y_mm);
    }
    println!("  Output Dir: {}", args.output_dir);

    let output_dir = PathBuf::from(&args.output_dir);
    std::fs::create_dir_all(&output_dir)?;

    let (trigger, token) = shutdown_channel();
    tokio::spawn(stop_on_signal(trigger, args.duration));

    let summary = match args.backend {
        Backend::Sox => run(config, SoxCapture::new(), &output_dir, token).await?,
        Backend::Simulated => {
            let registry = ChannelRegistry::from_config(&config)?;
            let sim = SimulationConfig {
                source_x_mm: args.sim_x,
                source_y_mm: args.sim_y,
                speed_of_sound_mm_s: config.speed_of_sound_mm_s,
                ..SimulationConfig::default()
            };
            let capture = SimulatedCapture::new(sim, registry.channels());
            run(config, capture, &output_dir, token).await?
        }
    };

    let filename = output_dir.join(format!("session_{}_final.json", ts_file()));
    std::fs::write(&filename, serde_json::to_string_pretty(&summary)?)?;
    println!("[{}] Final save: {}", ts_now(), filename.display());

    print_summary(&summary);
    Ok(())
}

async fn run<C: AudioCapture>(
    config: MonitorConfig,
    capture: C,
    output_dir: &Path,
    token: impact_tracker_rs::ShutdownToken,
) -> Result<RunSummary> {
    let reporter = Reporter::create(output_dir)?;
    let mut monitor = Monitor::new(config, capture, reporter)?.with_status_dir(output_dir);
    Ok(monitor.run(token).await?)
}

/// Fire the trigger on Ctrl+C or after `duration` seconds (0 = never)
async fn stop_on_signal(trigger: ShutdownTrigger, duration: u64) {
    let timer = async {
        if duration > 0 {
            sleep(Duration::from_secs(duration)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                log::error!("Ctrl+C handler failed: {}", e);
            }
            println!("\n[{}] Interrupted, stopping...", ts_now());
        }
        _ = timer => {
            println!("[{}] Duration reached, stopping...", ts_now());
        }
    }
    trigger.fire();
}

fn print_summary(summary: &RunSummary) {
    println!("\n=== Final Stats ===");
    println!("Cycles: {}", summary.stats.cycles);
    println!("Detections: {}", summary.stats.detections);
    println!("Estimates: {}", summary.stats.estimates);
    println!("Accepted: {}", summary.stats.accepted);
    println!("Rejected: {}", summary.stats.rejected);
    println!("Failed reads: {}", summary.stats.failed_reads);
    for est in &summary.accepted {
        println!(
            "  impact at ({:.1}, {:.1}) mm, confidence {:.1}%",
            est.x_mm, est.y_mm, est.confidence
        );
    }
    if let Some(log) = &summary.log_file {
        println!("Session log: {}", log);
    }
}

fn ts_now() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

fn ts_file() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}
