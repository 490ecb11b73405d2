//! The "CONTROL" Engine - Trajectory Tracking
//!
//! Turns a trajectory plus the current vehicle state into one
//! [`ControlCommand`] per tick. The lateral law is selectable:
//!
//! | Algorithm      | Steering                                                   |
//! |----------------|------------------------------------------------------------|
//! | `pure-pursuit` | `atan2(2·L·sin α, Ld)` toward the lookahead point          |
//! | `stanley`      | heading error + `atan2(-k·e_front, v + ε)` at the front axle |
//! | `pid`          | PID on cross-track error, state kept between calls         |
//! | `lqr`          | fixed 2×3 gain on `[lateral, yaw error, speed error]`      |
//! | `mpc`          | curvature feed-forward + heading/lateral feedback          |
//!
//! The longitudinal channel is the same for all of them: a proportional
//! speed law split into throttle or brake. The `mpc` law is a one-step
//! heuristic over a short reference window, not an optimizer.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{require_non_negative, require_positive, ConfigError, ControlAlgorithm, VehicleConfig};
use crate::types::{normalize_angle, ControlCommand, Gear, TrackingError, Trajectory, VehicleState, Waypoint};

/// Added to the speed in the Stanley cross-track term.

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub algorithm: ControlAlgorithm,

    /// Pure pursuit lookahead (m, default: 8.0)
    pub lookahead_distance: f64,

    /// Extra lookahead per m/s of speed (s, default: 0.0)
    pub lookahead_time: f64,

    /// Stanley cross-track gain
    pub stanley_gain: f64,

    /// Added to the speed in the Stanley cross-track term so the correction
    /// stays bounded near standstill (m/s, default: 1.0)
    pub stanley_softening: f64,

    pub pid_kp: f64,
    pub pid_ki: f64,
    pub pid_kd: f64,

    /// Bound on the accumulated cross-track integral (m·s)
    pub integral_limit: f64,

    /// Rows: steering, acceleration. Columns: lateral, yaw error, speed error.
    pub lqr_gain: [[f64; 3]; 2],

    /// Waypoints in the reference window
    pub mpc_horizon: usize,
    pub mpc_heading_gain: f64,
    pub mpc_lateral_gain: f64,

    /// Throttle/brake per m/s of speed error
    pub speed_gain: f64,

    /// The nearest waypoint must be closer than this (m)
    pub max_reachable_distance: f64,

    /// Step used when consecutive states share a timestamp (s)
    pub dt: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            algorithm: ControlAlgorithm::PurePursuit,
            lookahead_distance: 8.0,
            lookahead_time: 0.0,
            stanley_gain: 1.0,
            stanley_softening: 1.0,
            pid_kp: 0.06,
            pid_ki: 0.005,
            pid_kd: 0.075,
            integral_limit: 2.0,
            lqr_gain: [[0.06, 0.72, 0.0], [0.0, 0.0, 0.5]],
            mpc_horizon: 10,
            mpc_heading_gain: 1.0,
            mpc_lateral_gain: 0.1,
            speed_gain: 0.5,
            max_reachable_distance: 10.0,
            dt: 0.1,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("controller.lookahead_distance", self.lookahead_distance)?;
        require_non_negative("controller.lookahead_time", self.lookahead_time)?;
        require_non_negative("controller.stanley_gain", self.stanley_gain)?;
        require_positive("controller.stanley_softening", self.stanley_softening)?;
        require_non_negative("controller.pid_kp", self.pid_kp)?;
        require_non_negative("controller.pid_ki", self.pid_ki)?;
        require_non_negative("controller.pid_kd", self.pid_kd)?;
        require_non_negative("controller.integral_limit", self.integral_limit)?;
        if self.lqr_gain.iter().flatten().any(|k| !k.is_finite()) {
            return Err(ConfigError::Invalid("controller.lqr_gain must be finite".to_string()));
        }
        if self.mpc_horizon == 0 {
            return Err(ConfigError::Invalid(
                "controller.mpc_horizon must be at least 1".to_string(),
            ));
        }
        require_non_negative("controller.mpc_heading_gain", self.mpc_heading_gain)?;
        require_non_negative("controller.mpc_lateral_gain", self.mpc_lateral_gain)?;
        require_positive("controller.speed_gain", self.speed_gain)?;
        require_positive("controller.max_reachable_distance", self.max_reachable_distance)?;
        require_positive("controller.dt", self.dt)
    }
}

/// Integral and derivative memory of the PID law.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PidState {
    pub integral: f64,
    pub previous_error: Option<f64>,
    pub last_timestamp: Option<f64>,
}

/// Signed lateral offset of (x, y) from a waypoint, positive to its left.
fn lateral_offset(wp: &Waypoint, x: f64, y: f64) -> f64 {
    let (s, c) = wp.heading.sin_cos();
    -s * (x - wp.x) + c * (y - wp.y)
}

// ============================================================================
// TRAJECTORY CONTROLLER (The Main Engine)
// ============================================================================

#[derive(Debug, Clone)]
pub struct TrajectoryController {
    config: ControllerConfig,
    vehicle: VehicleConfig,
    pid: PidState,
}

impl TrajectoryController {
    pub fn new(config: ControllerConfig, vehicle: VehicleConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        vehicle.validate()?;
        Ok(Self {
            config,
            vehicle,
            pid: PidState::default(),
        })
    }

    pub fn with_defaults() -> Self {
        Self {
            config: ControllerConfig::default(),
            vehicle: VehicleConfig::default(),
            pid: PidState::default(),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn algorithm(&self) -> ControlAlgorithm {
        self.config.algorithm
    }

    pub fn pid_state(&self) -> &PidState {
        &self.pid
    }

    /// Clear the PID memory.
    pub fn reset(&mut self) {
        self.pid = PidState::default();
    }

    /// Compute the command for this tick.
    ///
    /// `target_speed` overrides the speed stored on the nearest waypoint.
    /// Returns [`ControlCommand::emergency_stop`] when the trajectory is
    /// empty or its nearest point is out of reach.
    pub fn compute(
        &mut self,
        state: &VehicleState,
        trajectory: &Trajectory,
        target_speed: Option<f64>,
    ) -> ControlCommand {
        let (x, y) = (state.pose.x, state.pose.y);
        if !(x.is_finite() && y.is_finite() && state.heading.is_finite() && state.speed.is_finite()) {
            warn!("non-finite vehicle state, commanding emergency stop");
            return ControlCommand::emergency_stop(state.timestamp);
        }
        let nearest = match trajectory.nearest(x, y) {
            Some((index, distance)) if distance <= self.config.max_reachable_distance => index,
            Some((_, distance)) => {
                warn!(distance, limit = self.config.max_reachable_distance, "trajectory out of reach");
                return ControlCommand::emergency_stop(state.timestamp);
            }
            None => {
                warn!("empty trajectory, commanding emergency stop");
                return ControlCommand::emergency_stop(state.timestamp);
            }
        };

        let wp = &trajectory.waypoints[nearest];
        let reference_speed = match self.config.algorithm {
            ControlAlgorithm::Mpc => self.window_mean_speed(trajectory, nearest),
            _ => wp.velocity,
        };
        let target = target_speed
            .filter(|v| v.is_finite())
            .unwrap_or(reference_speed)
            .max(0.0);
        let error = TrackingError {
            lateral: lateral_offset(wp, x, y),
            heading: normalize_angle(wp.heading - state.heading),
            velocity: target - state.speed,
        };

        let (raw_steering, effort) = match self.config.algorithm {
            ControlAlgorithm::PurePursuit => (self.pure_pursuit(state, trajectory, nearest), self.speed_effort(&error)),
            ControlAlgorithm::Stanley => (self.stanley(state, trajectory), self.speed_effort(&error)),
            ControlAlgorithm::Pid => (self.pid(state, &error), self.speed_effort(&error)),
            ControlAlgorithm::Lqr => self.lqr(&error),
            ControlAlgorithm::Mpc => (self.mpc(trajectory, nearest, &error), self.speed_effort(&error)),
        };

        let limit = self.vehicle.max_steering_angle;
        let steering = if raw_steering.is_finite() {
            raw_steering.clamp(-limit, limit)
        } else {
            0.0
        };
        let (throttle, brake) = if effort >= 0.0 {
            (effort.min(1.0), 0.0)
        } else {
            (0.0, (-effort).min(1.0))
        };

        debug!(
            algorithm = %self.config.algorithm,
            nearest,
            steering,
            throttle,
            brake,
            lateral = error.lateral,
            heading = error.heading,
            "control computed"
        );

        ControlCommand {
            steering,
            throttle,
            brake,
            gear: Gear::Drive,
            timestamp: state.timestamp,
            error,
        }
    }

    fn speed_effort(&self, error: &TrackingError) -> f64 {
        self.config.speed_gain * error.velocity
    }

    fn window_mean_speed(&self, trajectory: &Trajectory, nearest: usize) -> f64 {
        let end = (nearest + self.config.mpc_horizon).min(trajectory.len());
        let window = &trajectory.waypoints[nearest..end];
        window.iter().map(|w| w.velocity).sum::<f64>() / window.len().max(1) as f64
    }

    /// Steer toward the waypoint whose distance is closest to the lookahead.
    fn pure_pursuit(&self, state: &VehicleState, trajectory: &Trajectory, nearest: usize) -> f64 {
        let lookahead = self.config.lookahead_distance + self.config.lookahead_time * state.speed.max(0.0);
        let target = trajectory.waypoints[nearest..]
            .iter()
            .min_by(|a, b| {
                let da = (a.distance_to(state.pose.x, state.pose.y) - lookahead).abs();
                let db = (b.distance_to(state.pose.x, state.pose.y) - lookahead).abs();
                da.total_cmp(&db)
            })
            .unwrap_or(&trajectory.waypoints[nearest]);

        let (forward, left) = state.to_body_frame(target.x, target.y);
        let alpha = left.atan2(forward);
        (2.0 * self.vehicle.wheelbase * alpha.sin()).atan2(lookahead)
    }

    /// Heading error plus a speed-attenuated cross-track term, both taken
    /// at the front axle.
    fn stanley(&self, state: &VehicleState, trajectory: &Trajectory) -> f64 {
        let (s, c) = state.heading.sin_cos();
        let front_x = state.pose.x + self.vehicle.wheelbase * c;
        let front_y = state.pose.y + self.vehicle.wheelbase * s;
        let Some((index, _)) = trajectory.nearest(front_x, front_y) else {
            return 0.0;
        };
        let wp = &trajectory.waypoints[index];
        let heading_error = normalize_angle(wp.heading - state.heading);
        let cross_track = lateral_offset(wp, front_x, front_y);
        let softened_speed = state.speed.max(0.0) + self.config.stanley_softening;
        heading_error + (-self.config.stanley_gain * cross_track).atan2(softened_speed)
    }

    fn pid(&mut self, state: &VehicleState, error: &TrackingError) -> f64 {
        let dt = match self.pid.last_timestamp {
            Some(last) if state.timestamp > last => state.timestamp - last,
            _ => self.config.dt,
        };
        let e = error.lateral;
        let limit = self.config.integral_limit;
        self.pid.integral = (self.pid.integral + e * dt).clamp(-limit, limit);
        let derivative = self.pid.previous_error.map_or(0.0, |prev| (e - prev) / dt);
        self.pid.previous_error = Some(e);
        self.pid.last_timestamp = Some(state.timestamp);

        -(self.config.pid_kp * e + self.config.pid_ki * self.pid.integral + self.config.pid_kd * derivative)
    }

    /// `u = -K·z` with `z = [lateral, yaw error, speed error]`; the second
    /// row yields the longitudinal effort.
    fn lqr(&self, error: &TrackingError) -> (f64, f64) {
        let z = [error.lateral, -error.heading, -error.velocity];
        let row = |k: &[f64; 3]| -(k[0] * z[0] + k[1] * z[1] + k[2] * z[2]);
        (row(&self.config.lqr_gain[0]), row(&self.config.lqr_gain[1]))
    }

    fn mpc(&self, trajectory: &Trajectory, nearest: usize, error: &TrackingError) -> f64 {
        let end = (nearest + self.config.mpc_horizon).min(trajectory.len());
        let window = &trajectory.waypoints[nearest..end];
        let mean_curvature = window.iter().map(|w| w.curvature).sum::<f64>() / window.len().max(1) as f64;

        let feed_forward = (self.vehicle.wheelbase * mean_curvature).atan();
        feed_forward + self.config.mpc_heading_gain * error.heading - self.config.mpc_lateral_gain * error.lateral
    }
}
