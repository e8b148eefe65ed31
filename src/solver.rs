//! 2-D TDOA solver
//!
//! Three receivers give two time-difference equations in two unknowns, so
//! the Gauss-Newton normal equations are 2x2 and invert in closed form.
//! Two gates cut out the classic TDOA failure modes: a pre-flight
//! feasibility check against the receiver baselines (timestamp noise can
//! produce range differences no real source could cause), and a post-flight
//! room-bounds check (local minima can place the source far outside the
//! sensor plane).

use crate::config::RoomBounds;

const MAX_ITERATIONS: usize = 200;
/// Convergence threshold on both components of the update step
const STEP_EPSILON: f64 = 1e-9;
/// Below this determinant the normal equations are degenerate
const DET_EPSILON: f64 = 1e-20;
/// Floor on source-receiver distances, guards the singularity at a receiver
const DISTANCE_FLOOR: f64 = 1e-9;
/// Extension of the room bounds accepted by the post-flight gate (meters)
const ROOM_MARGIN_M: f64 = 2.0;

/// A receiver position with its adjusted arrival timestamp.
#[derive(Debug, Clone, Copy)]
pub struct Receiver {
    pub x: f64,
    pub y: f64,
    pub t_ms: f64,
}

/// Solver outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Solve {
    /// Converged inside the (extended) room. Position is rounded to 4
    /// decimal places and residual to 6; the rounding is part of the wire
    /// contract.
    Solved { x: f64, y: f64, residual: f64 },
    /// A range difference exceeds the corresponding receiver baseline
    Infeasible,
    /// The solution lies outside the room extended by the margin
    OutOfRoom,
}

/// Solve the TDOA system for three receivers.
///
/// The first receiver is the time reference; the caller fixes the order.
pub fn solve(receivers: &[Receiver; 3], speed_of_sound: f64, room: &RoomBounds) -> Solve {
    let [r0, r1, r2] = *receivers;

    // Time differences in seconds, range differences in meters
    let tau_10 = (r1.t_ms - r0.t_ms) / 1_000.0;
    let tau_20 = (r2.t_ms - r0.t_ms) / 1_000.0;
    let delta_10 = speed_of_sound * tau_10;
    let delta_20 = speed_of_sound * tau_20;

    // A range difference can never exceed the distance between the two
    // receivers that measured it.
    if delta_10.abs() > dist(r1.x, r1.y, r0.x, r0.y)
        || delta_20.abs() > dist(r2.x, r2.y, r0.x, r0.y)
    {
        return Solve::Infeasible;
    }

    // Start at the centroid of the receiver triangle
    let mut x = (r0.x + r1.x + r2.x) / 3.0;
    let mut y = (r0.y + r1.y + r2.y) / 3.0;

    for _ in 0..MAX_ITERATIONS {
        let d0 = dist(x, y, r0.x, r0.y).max(DISTANCE_FLOOR);
        let d1 = dist(x, y, r1.x, r1.y).max(DISTANCE_FLOOR);
        let d2 = dist(x, y, r2.x, r2.y).max(DISTANCE_FLOOR);

        let f1 = (d1 - d0) / speed_of_sound - tau_10;
        let f2 = (d2 - d0) / speed_of_sound - tau_20;

        let j1x = (x - r1.x) / (speed_of_sound * d1) - (x - r0.x) / (speed_of_sound * d0);
        let j1y = (y - r1.y) / (speed_of_sound * d1) - (y - r0.y) / (speed_of_sound * d0);
        let j2x = (x - r2.x) / (speed_of_sound * d2) - (x - r0.x) / (speed_of_sound * d0);
        let j2y = (y - r2.y) / (speed_of_sound * d2) - (y - r0.y) / (speed_of_sound * d0);

        // Normal equations (JtJ) delta = -Jtf, solved by 2x2 inverse
        let a = j1x * j1x + j2x * j2x;
        let b = j1x * j1y + j2x * j2y;
        let d = j1y * j1y + j2y * j2y;
        let det = a * d - b * b;
        if det.abs() < DET_EPSILON {
            break;
        }

        let g_x = j1x * f1 + j2x * f2;
        let g_y = j1y * f1 + j2y * f2;

        let dx = -(d * g_x - b * g_y) / det;
        let dy = -(a * g_y - b * g_x) / det;

        x += dx;
        y += dy;

        if dx.abs() < STEP_EPSILON && dy.abs() < STEP_EPSILON {
            break;
        }
    }

    let d0 = dist(x, y, r0.x, r0.y).max(DISTANCE_FLOOR);
    let d1 = dist(x, y, r1.x, r1.y).max(DISTANCE_FLOOR);
    let d2 = dist(x, y, r2.x, r2.y).max(DISTANCE_FLOOR);
    let e1 = d1 - d0 - delta_10;
    let e2 = d2 - d0 - delta_20;
    let residual = ((e1 * e1 + e2 * e2) / 2.0).sqrt();

    if !room.contains_with_margin(x, y, ROOM_MARGIN_M) {
        return Solve::OutOfRoom;
    }

    Solve::Solved {
        x: round_to(x, 4),
        y: round_to(y, 4),
        residual: round_to(residual, 6),
    }
}

fn dist(x0: f64, y0: f64, x1: f64, y1: f64) -> f64 {
    ((x0 - x1) * (x0 - x1) + (y0 - y1) * (y0 - y1)).sqrt()
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
