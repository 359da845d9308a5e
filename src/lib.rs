//! Acoustic impact detection and TDOA localization over a small microphone array.

pub mod aggregator;
pub mod calibration;
pub mod capture;
pub mod channels;
pub mod config;
pub mod detector;
pub mod error;
pub mod gate;
pub mod health_monitor;
pub mod live_status;
pub mod monitor;
pub mod report;
pub mod shutdown;
pub mod solver;
pub mod types;

pub use capture::{AudioCapture, SimulatedCapture, SimulationConfig, SoxCapture};
pub use config::MonitorConfig;
pub use error::{TrackerError, TrackerResult};
pub use monitor::{Monitor, MonitorState, RunSummary};
pub use shutdown::{shutdown_channel, ShutdownToken, ShutdownTrigger};
