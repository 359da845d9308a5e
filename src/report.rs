use crate::channels::ChannelRegistry;
use crate::error::TrackerResult;
use crate::types::{CycleResult, CycleStatus};
use chrono::{DateTime, Local};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// `<YYYY-MM-DD HH:MM:SS> - <message>`
pub fn format_line(at: &DateTime<Local>, message: &str) -> String {
    format!("{} - {}", at.format("%Y-%m-%d %H:%M:%S"), message)
}

/// Session log file name for a run started at `at`
pub fn log_file_name(at: &DateTime<Local>) -> String {
    format!("sound_detection_{}.txt", at.format("%d_%m_%y_%H%M%S"))
}

/// Operator-facing event lines: stdout plus an append-only session log.
pub struct Reporter {
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    echo: bool,
}

impl Reporter {
    /// Open `sound_detection_<timestamp>.txt` in `output_dir`, creating the directory.
    pub fn create(output_dir: &Path) -> TrackerResult<Self> {
        fs::create_dir_all(output_dir)?;
        let path = output_dir.join(log_file_name(&Local::now()));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Reporter {
            writer: Some(BufWriter::new(file)),
            path: Some(path),
            echo: true,
        })
    }

    /// Stdout only, no log file
    pub fn console() -> Self {
        Reporter {
            writer: None,
            path: None,
            echo: true,
        }
    }

    /// Stop echoing lines to stdout
    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn event(&mut self, message: &str) -> TrackerResult<()> {
        let line = format_line(&Local::now(), message);
        if self.echo {
            println!("{}", line);
        }
        if let Some(writer) = self.writer.as_mut() {
            writeln!(writer, "{}", line)?;
        }
        Ok(())
    }

    /// Render one cycle. Cycles without an estimate produce no line.
    pub fn report_cycle(
        &mut self,
        result: &CycleResult,
        registry: &ChannelRegistry,
    ) -> TrackerResult<()> {
        if result.status == CycleStatus::NoDetection {
            return Ok(());
        }
        self.event(&describe_cycle(result, registry))?;
        // accepted impacts hit the disk immediately
        if result.is_accepted() {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> TrackerResult<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Human-readable summary of an estimate cycle
pub fn describe_cycle(result: &CycleResult, registry: &ChannelRegistry) -> String {
    let channels = result
        .contributing_channels
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|id| registry.name(*id))
        .collect::<Vec<_>>()
        .join(", ");
    let position = match result.position {
        Some((x, y)) => format!("({:.1}, {:.1}) mm", x, y),
        None => "unknown position".to_string(),
    };
    let residual = result.residual.unwrap_or(f64::INFINITY);
    let confidence = result.confidence.unwrap_or(0.0);

    match (result.is_accepted(), result.rejection) {
        (true, _) => format!(
            "Impact detected at {} | confidence {:.1}% | residual {:.3e} | mics [{}]",
            position, confidence, residual, channels
        ),
        (false, Some(reason)) => format!(
            "Estimate rejected ({}) at {} | confidence {:.1}% | residual {:.3e} | mics [{}]",
            reason, position, confidence, residual, channels
        ),
        (false, None) => format!("Estimate rejected at {} | mics [{}]", position, channels),
    }
}
