pub mod multilateration;
pub mod nelder_mead;

pub use multilateration::{predicted_relative_times, travel_time, MultilaterationSolver, Solution};
pub use nelder_mead::{minimize, Minimum};
