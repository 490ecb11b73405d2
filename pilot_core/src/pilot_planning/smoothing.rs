//! Path post-processing: resampling, smoothing, geometry, speed profile.

use crate::config::VehicleConfig;
use crate::types::{normalize_angle, Waypoint};

/// Resample a polyline at (roughly) uniform arc-length spacing.
/// The first and last points are always kept.
pub fn resample(points: &[(f64, f64)], spacing: f64) -> Vec<(f64, f64)> {
    let Some(&first) = points.first() else {
        return Vec::new();
    };
    let mut out = vec![first];
    if points.len() == 1 || spacing <= 0.0 {
        out.extend_from_slice(&points[1..]);
        return out;
    }

    let mut carry = 0.0;
    for pair in points.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let length = (b.0 - a.0).hypot(b.1 - a.1);
        if length < 1e-9 {
            continue;
        }
        let mut s = spacing - carry;
        while s < length {
            let t = s / length;
            out.push((a.0 + t * (b.0 - a.0), a.1 + t * (b.1 - a.1)));
            s += spacing;
        }
        carry = length - (s - spacing);
    }

    let last = points[points.len() - 1];
    match out.last() {
        Some(&tail) if (tail.0 - last.0).hypot(tail.1 - last.1) < 0.25 * spacing && out.len() > 1 => {
            let n = out.len();
            out[n - 1] = last;
        }
        _ => out.push(last),
    }
    out
}

/// Centered moving average with the endpoints pinned.
///
/// Near the ends the window shrinks symmetrically so the start and goal
/// never move.
pub fn moving_average(points: &[(f64, f64)], window: usize) -> Vec<(f64, f64)> {
    let n = points.len();
    let half = window / 2;
    if n < 3 || half == 0 {
        return points.to_vec();
    }

    let mut out = Vec::with_capacity(n);
    out.push(points[0]);
    for i in 1..n - 1 {
        let h = half.min(i).min(n - 1 - i);
        let span = &points[i - h..=i + h];
        let count = span.len() as f64;
        let (sx, sy) = span.iter().fold((0.0, 0.0), |(sx, sy), p| (sx + p.0, sy + p.1));
        out.push((sx / count, sy / count));
    }
    out.push(points[n - 1]);
    out
}

/// Signed curvature of the circle through three points (left turn positive).
pub fn three_point_curvature(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> f64 {
    let ab = (b.0 - a.0).hypot(b.1 - a.1);
    let bc = (c.0 - b.0).hypot(c.1 - b.1);
    let ca = (a.0 - c.0).hypot(a.1 - c.1);
    let denom = ab * bc * ca;
    if denom < 1e-12 {
        return 0.0;
    }
    let cross = (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0);
    2.0 * cross / denom
}

/// Fill `heading` and `curvature` from the point geometry.
pub fn annotate_geometry(waypoints: &mut [Waypoint]) {
    let n = waypoints.len();
    if n < 2 {
        return;
    }

    let mut last_heading = waypoints[0].heading;
    for i in 0..n {
        let (prev, next) = (i.saturating_sub(1), (i + 1).min(n - 1));
        let dx = waypoints[next].x - waypoints[prev].x;
        let dy = waypoints[next].y - waypoints[prev].y;
        // Stationary stretches keep the previous heading
        if dx.hypot(dy) > 1e-9 {
            last_heading = dy.atan2(dx);
        }
        waypoints[i].heading = normalize_angle(last_heading);
    }

    for i in 0..n {
        waypoints[i].curvature = if i == 0 || i == n - 1 {
            0.0
        } else {
            let p = |k: usize| (waypoints[k].x, waypoints[k].y);
            three_point_curvature(p(i - 1), p(i), p(i + 1))
        };
    }
    if n >= 3 {
        waypoints[0].curvature = waypoints[1].curvature;
        waypoints[n - 1].curvature = waypoints[n - 2].curvature;
    }
}

/// Curvature-limited speed profile with forward/backward acceleration passes.
pub fn velocity_profile(
    waypoints: &mut [Waypoint],
    start_speed: f64,
    cruise_speed: f64,
    vehicle: &VehicleConfig,
    stop_at_end: bool,
) {
    let n = waypoints.len();
    if n == 0 {
        return;
    }

    let cap = cruise_speed.min(vehicle.max_speed).max(0.0);
    for wp in waypoints.iter_mut() {
        let kappa = wp.curvature.abs().max(1e-6);
        wp.velocity = cap.min((vehicle.max_lateral_acceleration / kappa).sqrt());
    }

    waypoints[0].velocity = waypoints[0].velocity.min(start_speed.max(0.0));
    for i in 1..n {
        let ds = waypoints[i - 1].distance_to(waypoints[i].x, waypoints[i].y);
        let reachable = (waypoints[i - 1].velocity.powi(2) + 2.0 * vehicle.max_acceleration * ds).sqrt();
        waypoints[i].velocity = waypoints[i].velocity.min(reachable);
    }

    if stop_at_end && n > 1 {
        waypoints[n - 1].velocity = 0.0;
    }
    for i in (0..n.saturating_sub(1)).rev() {
        let ds = waypoints[i].distance_to(waypoints[i + 1].x, waypoints[i + 1].y);
        let brakeable = (waypoints[i + 1].velocity.powi(2) + 2.0 * vehicle.max_deceleration * ds).sqrt();
        waypoints[i].velocity = waypoints[i].velocity.min(brakeable);
    }

    for i in 0..n {
        waypoints[i].acceleration = if i + 1 < n {
            let ds = waypoints[i].distance_to(waypoints[i + 1].x, waypoints[i + 1].y);
            (ds > 1e-9).then(|| {
                (waypoints[i + 1].velocity.powi(2) - waypoints[i].velocity.powi(2)) / (2.0 * ds)
            })
        } else {
            Some(0.0)
        };
    }
}
