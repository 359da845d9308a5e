//! Nelder-Mead downhill simplex in the plane
//!
//! Derivative-free, so it copes with the kink the `min` term puts into the
//! arrival-time objective. Deterministic: the initial simplex is built from
//! the seed alone and ties keep their previous order.
use crate::config::SolverConfig;
use crate::types::{Point2, Simplex2, SIMPLEX_VERTICES};

// Standard coefficients
const RHO: f64 = 1.0; // reflection
const CHI: f64 = 2.0; // expansion
const PSI: f64 = 0.5; // contraction
const SIGMA: f64 = 0.5; // shrink

#[derive(Clone, Copy, Debug)]
pub struct Minimum {
    pub point: Point2,
    pub value: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Seed plus one vertex per axis, offset by a relative step (absolute when the coordinate is 0)
pub fn initial_simplex(seed: Point2, options: &SolverConfig) -> Simplex2 {
    let mut simplex = [seed; SIMPLEX_VERTICES];
    for axis in 0..2 {
        let mut vertex = seed;
        vertex[axis] = if seed[axis] != 0.0 {
            (1.0 + options.relative_step) * seed[axis]
        } else {
            options.zero_step_mm
        };
        simplex[axis + 1] = vertex;
    }
    simplex
}

/// Minimize `f` from `seed`.
///
/// Non-finite objective values are treated as +inf so they always lose.
pub fn minimize<F>(f: F, seed: Point2, options: &SolverConfig) -> Minimum
where
    F: Fn(&Point2) -> f64,
{
    let eval = |p: &Point2| {
        let v = f(p);
        if v.is_finite() {
            v
        } else {
            f64::INFINITY
        }
    };

    let mut simplex = initial_simplex(seed, options);
    let mut values = [0.0; SIMPLEX_VERTICES];
    for (value, vertex) in values.iter_mut().zip(simplex.iter()) {
        *value = eval(vertex);
    }
    sort_simplex(&mut simplex, &mut values);

    let mut iterations = 0;
    let mut converged = has_converged(&simplex, &values, options);

    while !converged && iterations < options.max_iterations {
        if values.iter().all(|v| v.is_infinite()) {
            break;
        }
        iterations += 1;

        let worst = simplex[2];
        let xbar = (simplex[0] + simplex[1]) / 2.0;

        let xr = xbar + (xbar - worst) * RHO;
        let fxr = eval(&xr);

        if fxr < values[0] {
            let xe = xbar + (xbar - worst) * (RHO * CHI);
            let fxe = eval(&xe);
            if fxe < fxr {
                simplex[2] = xe;
                values[2] = fxe;
            } else {
                simplex[2] = xr;
                values[2] = fxr;
            }
        } else if fxr < values[1] {
            simplex[2] = xr;
            values[2] = fxr;
        } else {
            let shrink = if fxr < values[2] {
                // outside contraction
                let xc = xbar + (xbar - worst) * (PSI * RHO);
                let fxc = eval(&xc);
                if fxc <= fxr {
                    simplex[2] = xc;
                    values[2] = fxc;
                    false
                } else {
                    true
                }
            } else {
                // inside contraction
                let xcc = xbar - (xbar - worst) * PSI;
                let fxcc = eval(&xcc);
                if fxcc < values[2] {
                    simplex[2] = xcc;
                    values[2] = fxcc;
                    false
                } else {
                    true
                }
            };

            if shrink {
                let best = simplex[0];
                for j in 1..SIMPLEX_VERTICES {
                    simplex[j] = best + (simplex[j] - best) * SIGMA;
                    values[j] = eval(&simplex[j]);
                }
            }
        }

        sort_simplex(&mut simplex, &mut values);
        converged = has_converged(&simplex, &values, options);
    }

    Minimum {
        point: simplex[0],
        value: values[0],
        iterations,
        converged,
    }
}

/// Stable ascending sort by objective value
fn sort_simplex(simplex: &mut Simplex2, values: &mut [f64; SIMPLEX_VERTICES]) {
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    let sorted_points = order.map(|i| simplex[i]);
    let sorted_values = order.map(|i| values[i]);
    *simplex = sorted_points;
    *values = sorted_values;
}

fn has_converged(
    simplex: &Simplex2,
    values: &[f64; SIMPLEX_VERTICES],
    options: &SolverConfig,
) -> bool {
    let x_spread = simplex[1..]
        .iter()
        .map(|v| (v - simplex[0]).amax())
        .fold(0.0, f64::max);
    let f_spread = values[1..]
        .iter()
        .map(|&v| if v == values[0] { 0.0 } else { (v - values[0]).abs() })
        .fold(0.0, f64::max);
    x_spread <= options.xatol && f_spread <= options.fatol
}
