use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use impact_tracker_rs::channels::ChannelRegistry;
use impact_tracker_rs::config::MonitorConfig;
use impact_tracker_rs::gate::ImpactGate;
use impact_tracker_rs::solver::MultilaterationSolver;
use impact_tracker_rs::types::{ChannelId, CycleResult};
use serde::Deserialize;

/// Solve and gate recorded arrival times against the configured array
#[derive(Parser, Debug)]
struct Args {
    /// JSON file: {"arrivals":[{"channel":0,"time":0.0},...]}
    #[arg(long)]
    arrivals: PathBuf,

    /// Array config (defaults when omitted)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Deserialize)]
struct ArrivalRecord {
    channel: u8,
    /// Seconds, any common origin
    time: f64,
}

#[derive(Deserialize)]
struct ArrivalFile {
    arrivals: Vec<ArrivalRecord>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => MonitorConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MonitorConfig::default(),
    };
    let registry = ChannelRegistry::from_config(&config)?;

    let text = fs::read_to_string(&args.arrivals)
        .with_context(|| format!("reading {}", args.arrivals.display()))?;
    let mut file: ArrivalFile = serde_json::from_str(&text)?;
    if file.arrivals.len() < 2 {
        bail!("need at least 2 arrivals, got {}", file.arrivals.len());
    }
    file.arrivals.sort_by_key(|a| a.channel);

    let earliest = file
        .arrivals
        .iter()
        .map(|a| a.time)
        .fold(f64::INFINITY, f64::min);
    let channels: Vec<ChannelId> = file.arrivals.iter().map(|a| ChannelId(a.channel)).collect();
    let relative: Vec<f64> = file.arrivals.iter().map(|a| a.time - earliest).collect();
    let positions = registry.positions(&channels)?;

    let solver = MultilaterationSolver::from_config(&config);
    let gate = ImpactGate::from_config(&config);
    let estimate = gate.evaluate(solver.solve(&positions, &relative), channels, earliest);

    let result = CycleResult::from_estimate(&estimate, Vec::new());
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
