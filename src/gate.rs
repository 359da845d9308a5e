use crate::config::{BoundingBox, MonitorConfig};
use crate::error::TrackerResult;
use crate::solver::Solution;
use crate::types::{ChannelId, LocalizationEstimate, Rejection};
use log::debug;

/// Map a residual onto 0-100%; 100 at zero residual, 0 at or beyond `threshold`.
pub fn confidence(residual: f64, threshold: f64) -> f64 {
    if !residual.is_finite() || !(threshold > 0.0) {
        return 0.0;
    }
    ((1.0 - residual / threshold).max(0.0) * 100.0).clamp(0.0, 100.0)
}

/// Residual and bounding-box filter applied to every solver output
#[derive(Clone, Debug)]
pub struct ImpactGate {
    residual_threshold: f64,
    bounds: BoundingBox,
}

impl ImpactGate {
    pub fn new(residual_threshold: f64, bounds: BoundingBox) -> Self {
        Self {
            residual_threshold,
            bounds,
        }
    }

    pub fn from_config(config: &MonitorConfig) -> Self {
        Self::new(config.residual_threshold, config.bounds)
    }

    pub fn residual_threshold(&self) -> f64 {
        self.residual_threshold
    }

    pub fn bounds(&self) -> &BoundingBox {
        &self.bounds
    }

    /// Turn a solve attempt into an accepted or rejected estimate.
    ///
    /// A failed solve becomes a `SolverFailed` rejection with infinite residual
    /// and no position.
    pub fn evaluate(
        &self,
        solution: TrackerResult<Solution>,
        channels: Vec<ChannelId>,
        timestamp: f64,
    ) -> LocalizationEstimate {
        let solution = match solution {
            Ok(solution) => solution,
            Err(err) => {
                debug!("gate: {}", err);
                return LocalizationEstimate {
                    x_mm: f64::NAN,
                    y_mm: f64::NAN,
                    residual: f64::INFINITY,
                    confidence: 0.0,
                    accepted: false,
                    rejection: Some(Rejection::SolverFailed),
                    channels,
                    timestamp,
                };
            }
        };

        let residual_ok = solution.residual <= self.residual_threshold;
        let inside = self.bounds.contains(&solution.position);
        let rejection = match (residual_ok, inside) {
            (true, true) => None,
            (false, true) => Some(Rejection::ResidualTooHigh),
            (true, false) => Some(Rejection::OutOfBounds),
            (false, false) => Some(Rejection::Both),
        };

        LocalizationEstimate {
            x_mm: solution.position.x,
            y_mm: solution.position.y,
            residual: solution.residual,
            confidence: confidence(solution.residual, self.residual_threshold),
            accepted: rejection.is_none(),
            rejection,
            channels,
            timestamp,
        }
    }
}
