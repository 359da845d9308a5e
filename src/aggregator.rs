use crate::types::{Arrival, ArrivalSet, DetectionEvent};
use log::debug;

/// Groups one cycle's detections into a single arrival set.
#[derive(Clone, Debug)]
pub struct CoincidenceAggregator {
    window: f64,
}

impl CoincidenceAggregator {
    /// `window`: maximum spread (s) between the earliest and latest member
    pub fn new(window: f64) -> Self {
        Self { window }
    }

    pub fn window(&self) -> f64 {
        self.window
    }

    /// Arrival set for `events`, or `None` when fewer than two channels qualify.
    ///
    /// The earliest event is the reference (lowest channel id on a tie). Events
    /// later than `window` after it are dropped. One event per channel is kept.
    pub fn aggregate(&self, events: &[DetectionEvent]) -> Option<ArrivalSet> {
        let reference = events.iter().min_by(|a, b| {
            a.timestamp
                .total_cmp(&b.timestamp)
                .then(a.channel.cmp(&b.channel))
        })?;

        let mut arrivals: Vec<Arrival> = Vec::with_capacity(events.len());
        for event in events {
            let relative_time = event.timestamp - reference.timestamp;
            if relative_time > self.window {
                debug!(
                    "channel {} detection {:.4}s after reference, outside {:.4}s window",
                    event.channel, relative_time, self.window
                );
                continue;
            }
            if arrivals.iter().any(|a| a.channel == event.channel) {
                continue;
            }
            arrivals.push(Arrival {
                channel: event.channel,
                relative_time,
            });
        }

        if arrivals.len() < 2 {
            return None;
        }

        arrivals.sort_by_key(|a| a.channel);
        Some(ArrivalSet {
            reference_channel: reference.channel,
            reference_time: reference.timestamp,
            arrivals,
        })
    }
}
