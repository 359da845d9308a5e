//! Planar geometry types for the multilateration solver
//!
//! All coordinates are millimeters in the array's reference frame.

use nalgebra::Vector2;

// ===== Dimensions =====
pub const PLANE_DIM: usize = 2;
pub const SIMPLEX_VERTICES: usize = PLANE_DIM + 1; // 3

/// A point (or displacement) on the monitored surface, in mm.
pub type Point2 = Vector2<f64>;

/// Nelder-Mead simplex in the plane.
pub type Simplex2 = [Point2; SIMPLEX_VERTICES];

/// Arithmetic mean of a set of points, `None` for an empty slice.
pub fn centroid(points: &[Point2]) -> Option<Point2> {
    if points.is_empty() {
        return None;
    }
    let sum = points.iter().fold(Point2::zeros(), |acc, p| acc + p);
    Some(sum / points.len() as f64)
}

/// True when every point lies on one line (within `tolerance` mm of area).
pub fn are_colinear(points: &[Point2], tolerance: f64) -> bool {
    if points.len() < 3 {
        return true;
    }
    let origin = points[0];
    let Some(direction) = points
        .iter()
        .map(|p| p - origin)
        .find(|d| d.norm() > tolerance)
    else {
        return true;
    };
    points.iter().all(|p| {
        let d = p - origin;
        (direction.x * d.y - direction.y * d.x).abs() <= tolerance * direction.norm()
    })
}
