//! Pilot Core - Decision-and-Control Stack for Automated Driving
//!
//! This library turns raw per-sensor detections into actuation commands:
//! 1. **Tracking**: multi-sensor fusion into persistent tracks via a constant-acceleration EKF
//! 2. **Planning**: collision-free trajectories via A*, Hybrid-A*, RRT/RRT* or Frenet sampling
//! 3. **Behavior**: a priority-ordered state machine choosing target speed and lane
//! 4. **Control**: steering/throttle/brake via Pure Pursuit, Stanley, PID, LQR or a one-step MPC
//!
//! [`pilot_runtime::PilotAgent`] chains the four engines once per tick.

pub mod association;
pub mod config;
pub mod linalg;
pub mod pilot_behavior;
pub mod pilot_control;
pub mod pilot_planning;
pub mod pilot_runtime;
pub mod pilot_tracking;
pub mod types;
pub mod validation;

// Re-export key types for convenience
pub use config::{
    AssociationMethod, ConfigError, ControlAlgorithm, PilotConfig, PlanningAlgorithm, TrackingMethod,
    VehicleConfig,
};
pub use pilot_behavior::{BehaviorArbiter, BehaviorConfig, BehaviorDecision, BehaviorState, Mission};
pub use pilot_control::{ControllerConfig, TrajectoryController};
pub use pilot_planning::{Obstacle, PathPlanner, PlanRequest, PlannerConfig, PlanningError};
pub use pilot_runtime::{PilotAgent, TickInput, TickOutput};
pub use pilot_tracking::{ObjectTracker, TrackerConfig};
pub use types::{
    ControlCommand, DetectedObject, MapContext, ObjectClass, SensorBatch, SensorKind, TrackId, TrackedObject,
    Trajectory, VehicleState, Waypoint,
};
