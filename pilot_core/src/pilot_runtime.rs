//! Pilot Runtime - Orchestrates the four engines once per tick.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        PilotAgent                            │
//! │  Context: PilotContext  (now() for tracking + plan budgets)  │
//! │                                                              │
//! │  detections ─▶ TRACKER ─▶ tracks ─┬─▶ PLANNER (every N ticks) │
//! │                                   │        │ trajectory       │
//! │                                   └─▶ BEHAVIOR                │
//! │                                            │ target speed     │
//! │                                   CONTROLLER ◀────────────────│
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Planning runs on a fixed cadence (`replan_interval_ticks`) and
//! additionally whenever no trajectory is held, the held one turns
//! unsafe, or the requested lane changes. A failed plan keeps the
//! previous trajectory; with nothing held the controller is bypassed and
//! the agent commands an emergency stop.
//!
//! The planning goal sits `planning_horizon` metres down the route,
//! shifted sideways by the behavior's lane target, and pulled in short of
//! an in-lane lead vehicle so the path never runs through it.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use pilot_env::PilotContext;

use crate::config::{ConfigError, PilotConfig};
use crate::pilot_behavior::{BehaviorArbiter, BehaviorContext, BehaviorDecision, Mission};
use crate::pilot_control::TrajectoryController;
use crate::pilot_planning::frenet::ReferenceLine;
use crate::pilot_planning::{Obstacle, PathPlanner, PlanRequest};
use crate::pilot_tracking::ObjectTracker;
use crate::types::{ControlCommand, MapContext, Pose2D, SensorBatch, TrackedObject, Trajectory, VehicleState};

/// Goals closer than this are not worth planning to (m).
const MIN_GOAL_DISTANCE: f64 = 3.0;

/// Clearance kept between the goal and an in-lane lead (m).
const LEAD_GOAL_CLEARANCE: f64 = 1.0;

/// Length of the default route laid along the initial heading (m).
const DEFAULT_ROUTE_LENGTH: f64 = 1000.0;

/// Spacing of the shifted reference line handed to the planner (m).
const REFERENCE_SPACING: f64 = 1.0;

/// Per-tick inputs from perception, localization and the map.
#[derive(Debug, Clone, Copy)]
pub struct TickInput<'a> {
    pub ego: &'a VehicleState,
    pub batches: &'a [SensorBatch],
    pub map: &'a MapContext,
    pub mission: Mission,
    /// Ego offset from its lane centre (m, left positive)
    pub lane_offset: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickOutput {
    pub tick: u64,
    pub tracks: Vec<TrackedObject>,
    pub decision: BehaviorDecision,
    pub command: ControlCommand,
    pub replanned: bool,
    /// Diagnostic of a failed planning attempt this tick
    pub planning_error: Option<String>,
    /// Whether the trajectory being followed passed this tick's safety check
    pub trajectory_safe: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStats {
    pub ticks: u64,
    pub plans: u64,
    pub planning_failures: u64,
    pub emergency_stops: u64,
}

/// One ego vehicle's decision-and-control stack.
///
/// Generic over the context so the same agent runs against the wall clock
/// or a virtual simulation clock.
pub struct PilotAgent<Ctx: PilotContext> {
    /// Environment context
    pub context: Arc<Ctx>,

    pub config: PilotConfig,

    /// Tracking Engine - detections to tracks
    pub tracker: ObjectTracker,

    /// Planning Engine - tracks to trajectories
    pub planner: PathPlanner,

    /// Behavior Engine - tracks + map to target speed and lane
    pub arbiter: BehaviorArbiter,

    /// Control Engine - trajectory to actuation
    pub controller: TrajectoryController,

    route: Option<ReferenceLine>,
    trajectory: Option<Trajectory>,
    /// Lateral target the held trajectory was planned for
    planned_lateral: f64,
    ticks_since_plan: u32,
    tick_count: u64,
    stats: RuntimeStats,
}

impl<Ctx: PilotContext> std::fmt::Debug for PilotAgent<Ctx> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PilotAgent")
            .field("tick_count", &self.tick_count)
            .field("state", &self.arbiter.state())
            .field("has_trajectory", &self.trajectory.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}

impl<Ctx: PilotContext> PilotAgent<Ctx> {
    /// Build every engine from `config`. Fails on invalid or unsupported settings.
    pub fn new(context: Arc<Ctx>, config: PilotConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let tracker = ObjectTracker::new(config.tracker.clone())?;
        let shared: Arc<dyn PilotContext> = context.clone();
        let planner = PathPlanner::new(config.planner.clone(), config.vehicle.clone())?.with_context(shared);
        let arbiter = BehaviorArbiter::new(config.behavior.clone())?;
        let controller = TrajectoryController::new(config.controller.clone(), config.vehicle.clone())?;

        info!(
            planner = %config.planner.algorithm,
            controller = %config.controller.algorithm,
            association = %config.tracker.association,
            seed = context.seed(),
            "pilot agent created"
        );

        Ok(Self {
            context,
            config,
            tracker,
            planner,
            arbiter,
            controller,
            route: None,
            trajectory: None,
            planned_lateral: 0.0,
            ticks_since_plan: 0,
            tick_count: 0,
            stats: RuntimeStats::default(),
        })
    }

    /// Follow this polyline (lane centre of the starting lane).
    pub fn with_route(mut self, points: Vec<Vector2<f64>>) -> Result<Self, ConfigError> {
        self.set_route(points)?;
        Ok(self)
    }

    pub fn set_route(&mut self, points: Vec<Vector2<f64>>) -> Result<(), ConfigError> {
        let route = ReferenceLine::new(points).ok_or_else(|| {
            ConfigError::Invalid("route needs at least two distinct finite points".to_string())
        })?;
        self.route = Some(route);
        self.trajectory = None;
        Ok(())
    }

    /// Returns the current time from the context.
    pub fn now_secs(&self) -> f64 {
        self.context.now_secs()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn stats(&self) -> &RuntimeStats {
        &self.stats
    }

    /// The trajectory currently being followed.
    pub fn trajectory(&self) -> Option<&Trajectory> {
        self.trajectory.as_ref()
    }

    /// Clear tracks, behavior state, controller memory and the held trajectory.
    pub fn reset(&mut self) {
        self.tracker.reset();
        self.arbiter.reset();
        self.controller.reset();
        self.trajectory = None;
        self.planned_lateral = 0.0;
        self.ticks_since_plan = 0;
        info!(tick = self.tick_count, "pilot agent reset");
    }

    /// Run one full perception-to-actuation cycle.
    pub fn tick(&mut self, input: &TickInput<'_>) -> TickOutput {
        self.tick_count += 1;
        self.stats.ticks += 1;
        let now = self.now_secs();
        let ego = input.ego;

        // 1. Tracking
        self.tracker
            .set_reference(nalgebra::Vector3::new(ego.pose.x, ego.pose.y, ego.pose.z));
        let tracks = self.tracker.fuse(input.batches, now);
        let obstacles: Vec<Obstacle> = tracks.iter().map(Obstacle::from_tracked).collect();

        // 2. Planning
        let trajectory_safe = match self.trajectory.as_mut() {
            Some(held) => self.planner.validate(held, &obstacles),
            None => false,
        };
        if self.route.is_none() {
            self.route = ReferenceLine::along_heading(&ego.pose2d(), DEFAULT_ROUTE_LENGTH);
        }

        let lane_width = input.map.lane.width;
        let previous = self.arbiter.decision();
        let lateral = previous.lane_index as f64 * lane_width + previous.target_lane_offset;
        let interval = self.config.runtime.replan_interval_ticks;
        let replan = self.trajectory.is_none()
            || !trajectory_safe
            || self.ticks_since_plan + 1 >= interval
            || (lateral - self.planned_lateral).abs() > 1e-6;

        let mut replanned = false;
        let mut planning_error = None;
        if replan {
            self.ticks_since_plan = 0;
            match self.plan(ego, lateral, obstacles) {
                Ok(Some(trajectory)) => {
                    self.trajectory = Some(trajectory);
                    self.planned_lateral = lateral;
                    self.stats.plans += 1;
                    replanned = true;
                }
                Ok(None) => debug!(tick = self.tick_count, "route exhausted, no goal ahead"),
                Err(reason) => {
                    warn!(tick = self.tick_count, %reason, "planning failed, keeping previous trajectory");
                    self.stats.planning_failures += 1;
                    planning_error = Some(reason);
                }
            }
        } else {
            self.ticks_since_plan += 1;
        }
        let trajectory_safe = self.trajectory.as_ref().is_some_and(|t| t.safe);

        // 3. Behavior
        let decision = self.arbiter.plan(&BehaviorContext {
            ego,
            objects: &tracks,
            map: input.map,
            mission: input.mission,
            lane_offset: input.lane_offset,
            timestamp: ego.timestamp,
        });

        // 4. Control
        let command = match &self.trajectory {
            Some(trajectory) => self
                .controller
                .compute(ego, trajectory, Some(decision.target_speed)),
            None => {
                warn!(tick = self.tick_count, "no trajectory held, commanding emergency stop");
                ControlCommand::emergency_stop(ego.timestamp)
            }
        };
        if command.is_emergency_stop() {
            self.stats.emergency_stops += 1;
        }

        debug!(
            tick = self.tick_count,
            tracks = tracks.len(),
            state = %decision.state,
            target_speed = decision.target_speed,
            steering = command.steering,
            throttle = command.throttle,
            brake = command.brake,
            replanned,
            "tick complete"
        );

        TickOutput {
            tick: self.tick_count,
            tracks,
            decision,
            command,
            replanned,
            planning_error,
            trajectory_safe,
        }
    }

    /// Plan toward the next goal on the route. `Ok(None)` when the route
    /// has no room left ahead.
    fn plan(&self, ego: &VehicleState, lateral: f64, obstacles: Vec<Obstacle>) -> Result<Option<Trajectory>, String> {
        let Some(route) = &self.route else {
            return Ok(None);
        };
        let (station, _) = route.project(ego.pose.x, ego.pose.y);

        let mut distance = self.config.runtime.planning_horizon;
        let decision = self.arbiter.decision();
        if !decision.state.is_lane_change() {
            if let Some(lead) = self.arbiter.last_assessment().and_then(|a| a.lead) {
                distance = (lead.gap - LEAD_GOAL_CLEARANCE).clamp(MIN_GOAL_DISTANCE, distance);
            }
        }
        let goal_station = (station + distance).min(route.length());
        if goal_station - station < MIN_GOAL_DISTANCE {
            return Ok(None);
        }

        let (gx, gy) = route.to_cartesian(goal_station, lateral);
        let goal = Pose2D::new(gx, gy, route.heading_at(goal_station));

        // Reference line for the target lane, from just behind the ego to
        // well past the goal
        let from = (station - 5.0).max(0.0);
        let to = (goal_station + distance).min(route.length());
        let count = ((to - from) / REFERENCE_SPACING).ceil().max(1.0) as usize;
        let reference: Vec<Vector2<f64>> = (0..=count)
            .map(|i| {
                let s = (from + i as f64 * REFERENCE_SPACING).min(to);
                let (x, y) = route.to_cartesian(s, lateral);
                Vector2::new(x, y)
            })
            .collect();

        let request = PlanRequest::new(ego.pose2d(), goal)
            .with_speeds(ego.speed.max(0.0), self.config.behavior.cruise_speed)
            .with_obstacles(obstacles)
            .with_reference_line(reference);

        self.planner.plan(&request).map(Some).map_err(|e| e.reason())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pilot_behavior::BehaviorState;
    use crate::types::{DetectedObject, ObjectClass, SensorKind};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    /// Clock that only moves when told to.
    #[derive(Default)]
    struct ManualClock {
        micros: AtomicU64,
    }

    impl ManualClock {
        fn advance(&self, seconds: f64) {
            self.micros
                .fetch_add((seconds * 1e6).round() as u64, Ordering::SeqCst);
        }
    }

    impl PilotContext for ManualClock {
        fn now(&self) -> Duration {
            Duration::from_micros(self.micros.load(Ordering::SeqCst))
        }

        fn seed(&self) -> u64 {
            7
        }
    }

    fn agent() -> (Arc<ManualClock>, PilotAgent<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let agent = PilotAgent::new(clock.clone(), PilotConfig::default())
            .unwrap()
            .with_route(vec![Vector2::new(0.0, 0.0), Vector2::new(500.0, 0.0)])
            .unwrap();
        (clock, agent)
    }

    fn tick(agent: &mut PilotAgent<ManualClock>, ego: &VehicleState, batches: &[SensorBatch]) -> TickOutput {
        let map = MapContext::default();
        agent.tick(&TickInput {
            ego,
            batches,
            map: &map,
            mission: Mission::Cruise,
            lane_offset: 0.0,
        })
    }

    #[test]
    fn test_first_tick_plans_and_drives() {
        let (_, mut agent) = agent();
        let ego = VehicleState::planar(0.0, 0.0, 0.0, 5.0, 0.0);
        let out = tick(&mut agent, &ego, &[]);

        assert!(out.replanned);
        assert!(out.trajectory_safe);
        assert_eq!(out.decision.state, BehaviorState::LaneKeep);
        assert!(out.command.throttle > 0.0);
        assert!(out.command.steering.abs() < 0.05);
        let last = agent.trajectory().unwrap().last().unwrap();
        assert!((last.x - 40.0).abs() < 1.0, "goal at {}", last.x);
    }

    #[test]
    fn test_replans_on_cadence() {
        let (clock, mut agent) = agent();
        let mut replans = Vec::new();
        for i in 0..11 {
            let ego = VehicleState::planar(i as f64, 0.0, 0.0, 10.0, i as f64 * 0.1);
            replans.push(tick(&mut agent, &ego, &[]).replanned);
            clock.advance(0.1);
        }
        let ticks: Vec<usize> = replans
            .iter()
            .enumerate()
            .filter_map(|(i, &r)| r.then_some(i))
            .collect();
        assert_eq!(ticks, vec![0, 5, 10]);
        assert_eq!(agent.stats().plans, 3);
    }

    #[test]
    fn test_goal_stops_short_of_lead() {
        let (clock, mut agent) = agent();
        let lead = SensorBatch::new(
            "front_radar",
            SensorKind::Radar,
            vec![DetectedObject::new(25.0, 0.0, ObjectClass::Vehicle, 0.9).with_velocity(8.0, 0.0)],
        );
        // First tick only learns about the lead; the next plan respects it
        for i in 0..6 {
            let ego = VehicleState::planar(0.0, 0.0, 0.0, 8.0, i as f64 * 0.1);
            tick(&mut agent, &ego, std::slice::from_ref(&lead));
            clock.advance(0.1);
        }
        let last = agent.trajectory().unwrap().last().unwrap();
        assert!(last.x < 21.0, "goal at {}", last.x);
        assert!(agent.trajectory().unwrap().safe);
    }

    #[test]
    fn test_reset_clears_everything() {
        let (_, mut agent) = agent();
        let ego = VehicleState::planar(0.0, 0.0, 0.0, 5.0, 0.0);
        tick(&mut agent, &ego, &[]);
        agent.reset();

        assert!(agent.trajectory().is_none());
        assert_eq!(agent.arbiter.state(), BehaviorState::Idle);
        assert_eq!(agent.tracker.track_count(), 0);
    }

    #[test]
    fn test_rejects_unsupported_tracker() {
        let clock = Arc::new(ManualClock::default());
        let mut config = PilotConfig::default();
        config.tracker.method = crate::config::TrackingMethod::Particle;
        assert!(matches!(
            PilotAgent::new(clock, config),
            Err(ConfigError::Unsupported(_))
        ));
    }
}
