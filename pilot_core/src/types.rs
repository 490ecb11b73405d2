//! Shared data model for the decision-and-control stack.
//!
//! Everything that crosses a module boundary lives here: sensor input,
//! track output, vehicle state, trajectories, control commands, and the
//! read-only map snapshot the arbiter consumes.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;

/// Lower bound on the speed used to turn arc length into time.
const MIN_TIMING_SPEED: f64 = 0.5;

/// Wrap an angle into (-π, π].
pub fn normalize_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped <= -PI {
        wrapped + 2.0 * PI
    } else {
        wrapped
    }
}

// ============================================================================
// PERCEPTION
// ============================================================================

/// Semantic class of a detected or tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectClass {
    #[default]
    Unknown,
    Vehicle,
    Pedestrian,
    Cyclist,
    Static,
}

impl ObjectClass {
    /// Radius of a disc that covers the object's footprint (meters).
    pub fn footprint_radius(self) -> f64 {
        match self {
            ObjectClass::Vehicle => 2.0,
            ObjectClass::Pedestrian => 0.5,
            ObjectClass::Cyclist => 0.8,
            ObjectClass::Static | ObjectClass::Unknown => 1.0,
        }
    }

    pub fn is_vulnerable(self) -> bool {
        matches!(self, ObjectClass::Pedestrian | ObjectClass::Cyclist)
    }
}

/// Sensor modality, used to look up per-sensor reliability during fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SensorKind {
    Camera,
    Lidar,
    Radar,
    Ultrasonic,
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SensorKind::Camera => "camera",
            SensorKind::Lidar => "lidar",
            SensorKind::Radar => "radar",
            SensorKind::Ultrasonic => "ultrasonic",
        };
        f.write_str(name)
    }
}

/// A single detection reported by one sensor channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub position: Vector3<f64>,
    /// Only some sensors (radar) measure velocity directly
    pub velocity: Option<Vector3<f64>>,
    pub class: ObjectClass,
    /// Detector confidence in [0, 1]
    pub confidence: f64,
}

impl DetectedObject {
    /// Planar detection at (x, y) without a velocity measurement.
    pub fn new(x: f64, y: f64, class: ObjectClass, confidence: f64) -> Self {
        Self {
            position: Vector3::new(x, y, 0.0),
            velocity: None,
            class,
            confidence,
        }
    }

    pub fn with_velocity(mut self, vx: f64, vy: f64) -> Self {
        self.velocity = Some(Vector3::new(vx, vy, 0.0));
        self
    }

    /// NaN or infinite positions are dropped before association.
    pub fn is_finite(&self) -> bool {
        self.position.iter().all(|v| v.is_finite())
            && self.confidence.is_finite()
            && self
                .velocity
                .map_or(true, |v| v.iter().all(|c| c.is_finite()))
    }
}

/// All detections one sensor channel produced in a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorBatch {
    /// Channel name, e.g. "front_lidar"
    pub channel: String,
    pub kind: SensorKind,
    pub detections: Vec<DetectedObject>,
}

impl SensorBatch {
    pub fn new(channel: impl Into<String>, kind: SensorKind, detections: Vec<DetectedObject>) -> Self {
        Self {
            channel: channel.into(),
            kind,
            detections,
        }
    }
}

/// Opaque, unique, monotonically assigned track identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Tracker output: one fused, filtered object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedObject {
    pub id: TrackId,
    pub class: ObjectClass,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub acceleration: Vector3<f64>,
    /// Planar speed (m/s)
    pub speed: f64,
    /// Direction of planar velocity (rad)
    pub heading: f64,
    /// Distance from the tracker's reference point (m)
    pub distance: f64,
    pub confidence: f64,
    /// Seconds since the last associated detection
    pub age: f64,
    pub consecutive_hits: u32,
    pub consecutive_misses: u32,
    pub last_update: f64,
}

// ============================================================================
// VEHICLE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

/// Planar pose used for planning start and goal.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose2D {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
}

impl Pose2D {
    pub fn new(x: f64, y: f64, heading: f64) -> Self {
        Self { x, y, heading }
    }

    pub fn distance_to(&self, other: &Pose2D) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.heading.is_finite()
    }
}

/// Ego vehicle state as reported by localization.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VehicleState {
    pub pose: Pose,
    pub velocity: Vector3<f64>,
    pub angular_velocity: Vector3<f64>,
    pub acceleration: Vector3<f64>,
    pub speed: f64,
    pub heading: f64,
    pub steering_angle: f64,
    pub steering_rate: f64,
    pub timestamp: f64,
}

impl VehicleState {
    /// Flat-ground state moving along its heading.
    pub fn planar(x: f64, y: f64, yaw: f64, speed: f64, timestamp: f64) -> Self {
        Self {
            pose: Pose {
                x,
                y,
                yaw,
                ..Pose::default()
            },
            velocity: Vector3::new(speed * yaw.cos(), speed * yaw.sin(), 0.0),
            speed,
            heading: yaw,
            timestamp,
            ..Self::default()
        }
    }

    pub fn position(&self) -> Vector2<f64> {
        Vector2::new(self.pose.x, self.pose.y)
    }

    pub fn pose2d(&self) -> Pose2D {
        Pose2D::new(self.pose.x, self.pose.y, self.heading)
    }

    /// Express a world point in the vehicle frame (x forward, y left).
    pub fn to_body_frame(&self, x: f64, y: f64) -> (f64, f64) {
        let (dx, dy) = (x - self.pose.x, y - self.pose.y);
        let (s, c) = self.heading.sin_cos();
        (c * dx + s * dy, -s * dx + c * dy)
    }
}

// ============================================================================
// TRAJECTORY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Waypoint {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
    pub curvature: f64,
    pub velocity: f64,
    pub acceleration: Option<f64>,
}

impl Waypoint {
    pub fn new(x: f64, y: f64, heading: f64, velocity: f64) -> Self {
        Self {
            x,
            y,
            heading,
            velocity,
            ..Self::default()
        }
    }

    pub fn distance_to(&self, x: f64, y: f64) -> f64 {
        (self.x - x).hypot(self.y - y)
    }
}

/// Time-parameterized path produced by the planner.
///
/// `times` always has one entry per waypoint and never decreases.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Trajectory {
    pub waypoints: Vec<Waypoint>,
    pub times: Vec<f64>,
    pub cost: f64,
    pub length: f64,
    pub duration: f64,
    /// No waypoint violates the safety margin of any known obstacle
    pub safe: bool,
    /// Curvature and acceleration stay within vehicle limits
    pub feasible: bool,
}

impl Trajectory {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from waypoints, deriving timestamps from arc length and the
    /// waypoint velocities.
    pub fn from_waypoints(waypoints: Vec<Waypoint>, cost: f64) -> Self {
        let mut times = Vec::with_capacity(waypoints.len());
        let mut t = 0.0;
        for (i, wp) in waypoints.iter().enumerate() {
            if i > 0 {
                let prev = &waypoints[i - 1];
                let ds = prev.distance_to(wp.x, wp.y);
                let v = (0.5 * (prev.velocity.abs() + wp.velocity.abs())).max(MIN_TIMING_SPEED);
                t += ds / v;
            }
            times.push(t);
        }
        Self::assemble(waypoints, times, cost)
    }

    /// Build from explicit timestamps. Returns `None` when the lengths
    /// differ or the timestamps decrease.
    pub fn with_times(waypoints: Vec<Waypoint>, times: Vec<f64>, cost: f64) -> Option<Self> {
        if waypoints.len() != times.len() || times.windows(2).any(|w| w[1] < w[0]) {
            return None;
        }
        Some(Self::assemble(waypoints, times, cost))
    }

    /// Straight constant-speed path, handy for lane keeping and tests.
    pub fn straight_line(x: f64, y: f64, heading: f64, length: f64, spacing: f64, speed: f64) -> Self {
        let spacing = spacing.max(1e-3);
        let n = (length / spacing).ceil().max(1.0) as usize;
        let (s, c) = heading.sin_cos();
        let waypoints = (0..=n)
            .map(|i| {
                let d = (i as f64 * spacing).min(length);
                Waypoint::new(x + c * d, y + s * d, heading, speed)
            })
            .collect();
        let mut trajectory = Self::from_waypoints(waypoints, 0.0);
        trajectory.safe = true;
        trajectory.feasible = true;
        trajectory
    }

    fn assemble(waypoints: Vec<Waypoint>, times: Vec<f64>, cost: f64) -> Self {
        let length = waypoints
            .windows(2)
            .map(|w| w[0].distance_to(w[1].x, w[1].y))
            .sum();
        let duration = match (times.first(), times.last()) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        };
        Self {
            waypoints,
            times,
            cost,
            length,
            duration,
            safe: false,
            feasible: false,
        }
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    /// Index of the waypoint nearest to (x, y) and its distance.
    pub fn nearest(&self, x: f64, y: f64) -> Option<(usize, f64)> {
        self.waypoints
            .iter()
            .enumerate()
            .map(|(i, wp)| (i, wp.distance_to(x, y)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    pub fn last(&self) -> Option<&Waypoint> {
        self.waypoints.last()
    }
}

// ============================================================================
// CONTROL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Gear {
    Park,
    Reverse,
    Neutral,
    #[default]
    Drive,
}

/// Diagnostic errors attached to every command.
///
/// `lateral` is positive when the vehicle sits left of the path,
/// `heading` is path heading minus vehicle heading (wrapped), and
/// `velocity` is target speed minus current speed.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackingError {
    pub lateral: f64,
    pub heading: f64,
    pub velocity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlCommand {
    /// Road-wheel angle (rad), positive turns left
    pub steering: f64,
    pub throttle: f64,
    pub brake: f64,
    pub gear: Gear,
    pub timestamp: f64,
    pub error: TrackingError,
}

impl ControlCommand {
    /// Zero steering, zero throttle, full brake.
    pub fn emergency_stop(timestamp: f64) -> Self {
        Self {
            steering: 0.0,
            throttle: 0.0,
            brake: 1.0,
            gear: Gear::Drive,
            timestamp,
            error: TrackingError::default(),
        }
    }

    pub fn is_emergency_stop(&self) -> bool {
        self.brake >= 1.0 && self.throttle == 0.0 && self.steering == 0.0
    }
}

// ============================================================================
// MAP CONTEXT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LightState {
    Red,
    Yellow,
    Green,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrafficLight {
    pub x: f64,
    pub y: f64,
    pub state: LightState,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Junction {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
}

/// Lane topology around the ego vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneInfo {
    pub width: f64,
    pub left_available: bool,
    pub right_available: bool,
    pub speed_limit: Option<f64>,
    /// Distance until the current lane ends and must merge (m)
    pub ends_in: Option<f64>,
}

impl Default for LaneInfo {
    fn default() -> Self {
        Self {
            width: 3.5,
            left_available: false,
            right_available: false,
            speed_limit: None,
            ends_in: None,
        }
    }
}

/// Read-only map snapshot handed to the arbiter each tick.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MapContext {
    pub lane: LaneInfo,
    pub traffic_lights: Vec<TrafficLight>,
    pub junctions: Vec<Junction>,
}
