//! Frenet-frame trajectory sampling.
//!
//! Each candidate pairs a quintic lateral profile d(t) (settling on a
//! target offset from the reference line) with a quartic longitudinal
//! profile s(t) (settling on a target speed) over a fixed horizon.
//! Candidates are scored on jerk, offset and speed deviation; the caller
//! filters by feasibility and safety and keeps the cheapest.

use nalgebra::{DMatrix, DVector, Vector2};

use crate::config::VehicleConfig;
use crate::linalg::{self, LinalgError};
use crate::types::{normalize_angle, Pose2D, Trajectory, Waypoint};

use super::smoothing::annotate_geometry;
use super::PlannerConfig;

// ============================================================================
// REFERENCE LINE
// ============================================================================

/// Polyline with cumulative arc length, extrapolated linearly past its ends.
#[derive(Debug, Clone)]
pub struct ReferenceLine {
    points: Vec<Vector2<f64>>,
    stations: Vec<f64>,
}

impl ReferenceLine {
    /// Needs at least two distinct points.
    pub fn new(points: Vec<Vector2<f64>>) -> Option<Self> {
        let mut deduped: Vec<Vector2<f64>> = Vec::with_capacity(points.len());
        for p in points {
            if !p.iter().all(|v| v.is_finite()) {
                return None;
            }
            if deduped.last().map_or(true, |last| (p - last).norm() > 1e-9) {
                deduped.push(p);
            }
        }
        if deduped.len() < 2 {
            return None;
        }

        let mut stations = vec![0.0];
        for pair in deduped.windows(2) {
            let s = stations[stations.len() - 1] + (pair[1] - pair[0]).norm();
            stations.push(s);
        }
        Some(Self {
            points: deduped,
            stations,
        })
    }

    /// Straight line through `start` along `heading`.
    pub fn along_heading(start: &Pose2D, length: f64) -> Option<Self> {
        let origin = Vector2::new(start.x, start.y);
        let dir = Vector2::new(start.heading.cos(), start.heading.sin());
        Self::new(vec![origin, origin + dir * length.max(1.0)])
    }

    pub fn length(&self) -> f64 {
        self.stations[self.stations.len() - 1]
    }

    fn segment_count(&self) -> usize {
        self.points.len() - 1
    }

    /// Closest (s, d); d is positive to the left of the line.
    pub fn project(&self, x: f64, y: f64) -> (f64, f64) {
        let p = Vector2::new(x, y);
        let last = self.segment_count() - 1;
        let mut best = (f64::INFINITY, 0.0, 0.0);

        for i in 0..=last {
            let (a, b) = (self.points[i], self.points[i + 1]);
            let ab = b - a;
            let len = ab.norm();
            let mut t = (p - a).dot(&ab) / (len * len);
            if i > 0 {
                t = t.max(0.0);
            }
            if i < last {
                t = t.min(1.0);
            }
            let foot = a + ab * t;
            let dist = (p - foot).norm();
            if dist < best.0 {
                let cross = ab.x * (p.y - a.y) - ab.y * (p.x - a.x);
                best = (dist, self.stations[i] + t * len, cross / len);
            }
        }
        (best.1, best.2)
    }

    fn segment_at(&self, s: f64) -> usize {
        let last = self.segment_count() - 1;
        (0..last)
            .find(|&i| s < self.stations[i + 1])
            .unwrap_or(last)
    }

    /// Tangent heading at arc length `s`.
    pub fn heading_at(&self, s: f64) -> f64 {
        let i = self.segment_at(s);
        let ab = self.points[i + 1] - self.points[i];
        ab.y.atan2(ab.x)
    }

    /// World point at arc length `s` and lateral offset `d`.
    pub fn to_cartesian(&self, s: f64, d: f64) -> (f64, f64) {
        let i = self.segment_at(s);
        let (a, b) = (self.points[i], self.points[i + 1]);
        let ab = b - a;
        let unit = ab / ab.norm();
        let base = a + unit * (s - self.stations[i]);
        let normal = Vector2::new(-unit.y, unit.x);
        let p = base + normal * d;
        (p.x, p.y)
    }
}

// ============================================================================
// POLYNOMIALS
// ============================================================================

/// x(t) = c0 + c1 t + ... + c5 t⁵ matching position, velocity and
/// acceleration at both ends.
#[derive(Debug, Clone, Copy)]
pub struct QuinticPolynomial {
    c: [f64; 6],
}

impl QuinticPolynomial {
    pub fn new(
        x0: f64,
        v0: f64,
        a0: f64,
        x1: f64,
        v1: f64,
        a1: f64,
        t: f64,
    ) -> Result<Self, LinalgError> {
        let (c0, c1, c2) = (x0, v0, 0.5 * a0);
        let (t2, t3) = (t * t, t * t * t);
        let (t4, t5) = (t3 * t, t3 * t2);

        let a = DMatrix::from_row_slice(
            3,
            3,
            &[t3, t4, t5, 3.0 * t2, 4.0 * t3, 5.0 * t4, 6.0 * t, 12.0 * t2, 20.0 * t3],
        );
        let b = DVector::from_vec(vec![
            x1 - c0 - c1 * t - c2 * t2,
            v1 - c1 - 2.0 * c2 * t,
            a1 - 2.0 * c2,
        ]);
        let x = linalg::solve(&a, &b)?;

        Ok(Self {
            c: [c0, c1, c2, x[0], x[1], x[2]],
        })
    }

    pub fn value(&self, t: f64) -> f64 {
        let c = &self.c;
        c[0] + t * (c[1] + t * (c[2] + t * (c[3] + t * (c[4] + t * c[5]))))
    }

    pub fn d1(&self, t: f64) -> f64 {
        let c = &self.c;
        c[1] + t * (2.0 * c[2] + t * (3.0 * c[3] + t * (4.0 * c[4] + t * 5.0 * c[5])))
    }

    pub fn d2(&self, t: f64) -> f64 {
        let c = &self.c;
        2.0 * c[2] + t * (6.0 * c[3] + t * (12.0 * c[4] + t * 20.0 * c[5]))
    }

    pub fn d3(&self, t: f64) -> f64 {
        let c = &self.c;
        6.0 * c[3] + t * (24.0 * c[4] + t * 60.0 * c[5])
    }
}

/// Quartic used for velocity keeping: free end position, fixed end
/// velocity and acceleration.
#[derive(Debug, Clone, Copy)]
pub struct QuarticPolynomial {
    c: [f64; 5],
}

impl QuarticPolynomial {
    pub fn new(x0: f64, v0: f64, a0: f64, v1: f64, a1: f64, t: f64) -> Result<Self, LinalgError> {
        let (c0, c1, c2) = (x0, v0, 0.5 * a0);
        let t2 = t * t;

        let a = DMatrix::from_row_slice(2, 2, &[3.0 * t2, 4.0 * t2 * t, 6.0 * t, 12.0 * t2]);
        let b = DVector::from_vec(vec![v1 - c1 - 2.0 * c2 * t, a1 - 2.0 * c2]);
        let x = linalg::solve(&a, &b)?;

        Ok(Self {
            c: [c0, c1, c2, x[0], x[1]],
        })
    }

    pub fn value(&self, t: f64) -> f64 {
        let c = &self.c;
        c[0] + t * (c[1] + t * (c[2] + t * (c[3] + t * c[4])))
    }

    pub fn d1(&self, t: f64) -> f64 {
        let c = &self.c;
        c[1] + t * (2.0 * c[2] + t * (3.0 * c[3] + t * 4.0 * c[4]))
    }

    pub fn d2(&self, t: f64) -> f64 {
        let c = &self.c;
        2.0 * c[2] + t * (6.0 * c[3] + t * 12.0 * c[4])
    }

    pub fn d3(&self, t: f64) -> f64 {
        let c = &self.c;
        6.0 * c[3] + t * 24.0 * c[4]
    }
}

// ============================================================================
// CANDIDATES
// ============================================================================

#[derive(Debug, Clone)]
pub struct FrenetCandidate {
    pub lateral_offset: f64,
    pub target_speed: f64,
    pub trajectory: Trajectory,
    pub cost: f64,
    pub max_abs_curvature: f64,
    pub feasible: bool,
}

/// Sample every (offset, speed) pair from the planner configuration.
///
/// Points past `stop_station` (the goal's projection) are dropped so the
/// trajectory does not overshoot the goal.
pub fn generate_candidates(
    reference: &ReferenceLine,
    start: &Pose2D,
    start_speed: f64,
    cruise_speed: f64,
    stop_station: Option<f64>,
    config: &PlannerConfig,
    vehicle: &VehicleConfig,
) -> Result<Vec<FrenetCandidate>, LinalgError> {
    let (s0, d0) = reference.project(start.x, start.y);
    let delta = normalize_angle(start.heading - reference.heading_at(s0));
    let s0_dot = start_speed * delta.cos();
    let d0_dot = start_speed * delta.sin();

    let horizon = config.horizon;
    let steps = (horizon / config.sample_dt).round().max(1.0) as usize;
    let dt = horizon / steps as f64;
    let max_curvature = vehicle.max_curvature();

    let mut candidates = Vec::with_capacity(config.lateral_offsets.len() * config.speed_factors.len());
    for &offset in &config.lateral_offsets {
        let lateral = QuinticPolynomial::new(d0, d0_dot, 0.0, offset, 0.0, 0.0, horizon)?;

        for &factor in &config.speed_factors {
            let target_speed = (cruise_speed * factor).clamp(0.0, vehicle.max_speed);
            let longitudinal = QuarticPolynomial::new(s0, s0_dot, 0.0, target_speed, 0.0, horizon)?;

            let mut waypoints = Vec::with_capacity(steps + 1);
            let mut times = Vec::with_capacity(steps + 1);
            let mut jerk = 0.0;
            let mut speed_ok = true;
            let mut accel_ok = true;

            for k in 0..=steps {
                let t = k as f64 * dt;
                let s = longitudinal.value(t);
                if let Some(stop) = stop_station {
                    if s > stop && waypoints.len() >= 2 {
                        break;
                    }
                }
                let d = lateral.value(t);
                let (x, y) = reference.to_cartesian(s, d);
                let s_dot = longitudinal.d1(t);
                let s_ddot = longitudinal.d2(t);
                let speed = s_dot.hypot(lateral.d1(t));

                speed_ok &= speed <= vehicle.max_speed + 1e-9;
                accel_ok &= s_ddot <= vehicle.max_acceleration + 1e-9
                    && s_ddot >= -vehicle.max_deceleration - 1e-9;
                jerk += (lateral.d3(t).powi(2) + longitudinal.d3(t).powi(2)) * dt;

                let mut wp = Waypoint::new(x, y, 0.0, speed);
                wp.acceleration = Some(s_ddot);
                waypoints.push(wp);
                times.push(t);
            }

            waypoints[0].heading = start.heading;
            annotate_geometry(&mut waypoints);
            let max_abs_curvature = waypoints
                .iter()
                .map(|w| w.curvature.abs())
                .fold(0.0, f64::max);

            let cost = config.jerk_weight * jerk
                + config.lateral_weight * offset * offset
                + config.speed_weight * (target_speed - cruise_speed).powi(2);

            let Some(mut trajectory) = Trajectory::with_times(waypoints, times, cost) else {
                continue;
            };
            let feasible = speed_ok && accel_ok && max_abs_curvature <= max_curvature;
            trajectory.feasible = feasible;

            candidates.push(FrenetCandidate {
                lateral_offset: offset,
                target_speed,
                trajectory,
                cost,
                max_abs_curvature,
                feasible,
            });
        }
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_quintic_boundary_conditions() {
        let q = QuinticPolynomial::new(0.0, 1.0, 0.0, 3.5, 0.0, 0.0, 4.0).unwrap();

        assert_relative_eq!(q.value(0.0), 0.0, epsilon = 1e-9);
        assert_relative_eq!(q.d1(0.0), 1.0, epsilon = 1e-9);
        assert_relative_eq!(q.value(4.0), 3.5, epsilon = 1e-9);
        assert_relative_eq!(q.d1(4.0), 0.0, epsilon = 1e-9);
        assert_relative_eq!(q.d2(4.0), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_quartic_reaches_target_speed() {
        let q = QuarticPolynomial::new(0.0, 5.0, 0.0, 10.0, 0.0, 5.0).unwrap();

        assert_relative_eq!(q.d1(5.0), 10.0, epsilon = 1e-9);
        assert_relative_eq!(q.d2(5.0), 0.0, epsilon = 1e-9);
        // Peak acceleration of this profile is 1.5·Δv/T
        assert_relative_eq!(q.d2(2.5), 1.5, epsilon = 1e-9);
    }

    #[test]
    fn test_reference_projection_signs() {
        let line = ReferenceLine::new(vec![Vector2::new(0.0, 0.0), Vector2::new(10.0, 0.0), Vector2::new(10.0, 10.0)]).unwrap();

        let (s, d) = line.project(5.0, 1.0);
        assert_relative_eq!(s, 5.0, epsilon = 1e-9);
        assert_relative_eq!(d, 1.0, epsilon = 1e-9);

        let (s, d) = line.project(11.0, 5.0);
        assert_relative_eq!(s, 15.0, epsilon = 1e-9);
        assert_relative_eq!(d, -1.0, epsilon = 1e-9);

        let (x, y) = line.to_cartesian(15.0, -1.0);
        assert_relative_eq!(x, 11.0, epsilon = 1e-9);
        assert_relative_eq!(y, 5.0, epsilon = 1e-9);
    }

    #[test]
    fn test_reference_extrapolates_past_ends() {
        let line = ReferenceLine::new(vec![Vector2::new(0.0, 0.0), Vector2::new(10.0, 0.0)]).unwrap();
        let (s, _) = line.project(-3.0, 0.0);
        assert_relative_eq!(s, -3.0, epsilon = 1e-9);

        let (x, _) = line.to_cartesian(14.0, 0.0);
        assert_relative_eq!(x, 14.0, epsilon = 1e-9);

        assert!(ReferenceLine::new(vec![Vector2::new(1.0, 1.0), Vector2::new(1.0, 1.0)]).is_none());
    }

    #[test]
    fn test_candidate_grid_size_and_centered_is_straight() {
        let config = PlannerConfig::default();
        let vehicle = VehicleConfig::default();
        let line = ReferenceLine::new(vec![Vector2::new(0.0, 0.0), Vector2::new(200.0, 0.0)]).unwrap();
        let start = Pose2D::new(0.0, 0.0, 0.0);
        let candidates = generate_candidates(&line, &start, 10.0, 10.0, None, &config, &vehicle).unwrap();

        assert_eq!(candidates.len(), config.lateral_offsets.len() * config.speed_factors.len());

        let best = candidates
            .iter()
            .filter(|c| c.feasible)
            .min_by(|a, b| a.cost.total_cmp(&b.cost))
            .unwrap();
        assert_eq!(best.lateral_offset, 0.0);
        assert_relative_eq!(best.target_speed, 10.0, epsilon = 1e-9);
        assert!(best.trajectory.waypoints.iter().all(|w| w.y.abs() < 1e-9));
    }
}
