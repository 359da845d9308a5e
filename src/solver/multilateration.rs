use super::nelder_mead::minimize;
use crate::config::{MonitorConfig, SolverConfig};
use crate::error::{TrackerError, TrackerResult};
use crate::types::{are_colinear, centroid, Point2};
use log::debug;

/// Arrival times closer than this count as simultaneous (s)
const SIMULTANEOUS_SECS: f64 = 1e-9;
/// Positions closer than this count as coincident (mm)
const COINCIDENT_MM: f64 = 1e-6;

/// Time for sound to travel from `source` to `mic` (s)
pub fn travel_time(source: &Point2, mic: &Point2, speed: f64) -> f64 {
    (source - mic).norm() / speed
}

/// Relative arrival times a source at `x` would produce, referenced to the nearest mic.
pub fn predicted_relative_times(x: &Point2, positions: &[Point2], speed: f64) -> Vec<f64> {
    let absolute: Vec<f64> = positions.iter().map(|p| travel_time(x, p, speed)).collect();
    let earliest = absolute.iter().copied().fold(f64::INFINITY, f64::min);
    absolute.into_iter().map(|t| t - earliest).collect()
}

#[derive(Clone, Copy, Debug)]
pub struct Solution {
    pub position: Point2,
    /// Objective value at `position` (s²)
    pub residual: f64,
    pub iterations: usize,
}

/// Least-squares TDOA localization over a planar array.
#[derive(Clone, Debug)]
pub struct MultilaterationSolver {
    speed: f64,
    options: SolverConfig,
}

impl MultilaterationSolver {
    pub fn new(speed_mm_s: f64, options: SolverConfig) -> Self {
        Self {
            speed: speed_mm_s,
            options,
        }
    }

    pub fn from_config(config: &MonitorConfig) -> Self {
        Self::new(config.speed_of_sound_mm_s, config.solver)
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Sum of squared differences between predicted and observed relative times
    pub fn objective(&self, x: &Point2, positions: &[Point2], observed: &[f64]) -> f64 {
        predicted_relative_times(x, positions, self.speed)
            .iter()
            .zip(observed)
            .map(|(predicted, seen)| (predicted - seen).powi(2))
            .sum()
    }

    /// Find the source position that best explains `observed`.
    ///
    /// Seeds at the centroid of `positions`, then polishes once from the best
    /// vertex. Any input that cannot yield a reliable position is an error.
    pub fn solve(&self, positions: &[Point2], observed: &[f64]) -> TrackerResult<Solution> {
        self.check_input(positions, observed)?;

        let seed = centroid(positions)
            .ok_or_else(|| TrackerError::Solver("no positions".to_string()))?;
        let f = |x: &Point2| self.objective(x, positions, observed);

        let first = minimize(f, seed, &self.options);
        let polished = minimize(f, first.point, &self.options);
        let iterations = first.iterations + polished.iterations;

        debug!(
            "solver: seed ({:.1}, {:.1}) -> ({:.2}, {:.2}) residual {:.3e} after {} iterations",
            seed.x, seed.y, polished.point.x, polished.point.y, polished.value, iterations
        );

        if !polished.converged {
            return Err(TrackerError::Solver(format!(
                "no convergence within {} iterations (residual {:.3e})",
                self.options.max_iterations, polished.value
            )));
        }
        if !polished.value.is_finite() || !polished.point.iter().all(|c| c.is_finite()) {
            return Err(TrackerError::Solver("non-finite solution".to_string()));
        }

        Ok(Solution {
            position: polished.point,
            residual: polished.value,
            iterations,
        })
    }

    fn check_input(&self, positions: &[Point2], observed: &[f64]) -> TrackerResult<()> {
        if positions.len() < 2 {
            return Err(TrackerError::Solver(format!(
                "need at least 2 arrivals, got {}",
                positions.len()
            )));
        }
        if positions.len() != observed.len() {
            return Err(TrackerError::Solver(format!(
                "{} positions but {} arrival times",
                positions.len(),
                observed.len()
            )));
        }
        if !(self.speed.is_finite() && self.speed > 0.0) {
            return Err(TrackerError::Solver(format!("invalid speed {}", self.speed)));
        }
        if positions.iter().any(|p| !p.iter().all(|c| c.is_finite()))
            || observed.iter().any(|t| !t.is_finite())
        {
            return Err(TrackerError::Solver("non-finite input".to_string()));
        }

        let first = positions[0];
        if positions.iter().all(|p| (p - first).norm() <= COINCIDENT_MM) {
            return Err(TrackerError::Solver("all positions coincide".to_string()));
        }

        let simultaneous = observed
            .iter()
            .all(|t| (t - observed[0]).abs() <= SIMULTANEOUS_SECS);
        if positions.len() >= 3 && simultaneous && are_colinear(positions, COINCIDENT_MM) {
            return Err(TrackerError::Solver(
                "colinear array with simultaneous arrivals".to_string(),
            ));
        }

        Ok(())
    }
}
