//! The "PLANNING" Engine - Collision-Free Trajectory Generation
//!
//! One entry point, [`PathPlanner::plan`], dispatching on the configured
//! algorithm:
//! - `astar`: 8-connected grid search over an inflated occupancy grid
//! - `hybrid-astar`: search over (x, y, heading) with bicycle primitives
//! - `rrt` / `rrt-star`: seeded sampling trees
//! - `frenet`: lateral/longitudinal polynomial sampling along a reference
//!
//! Every result goes through the same post-processing: smoothing,
//! heading/curvature annotation, a speed profile, and a final safety
//! re-check against the raw obstacles. A path that turns unsafe after
//! smoothing is an error rather than a silently unsafe trajectory.

pub mod frenet;
pub mod grid;
pub mod sampling;
pub mod search;
pub mod smoothing;

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use pilot_env::{Deadline, PilotContext};

use crate::config::{
    require_non_negative, require_positive, require_unit_interval, ConfigError,
    PlanningAlgorithm, VehicleConfig,
};
use crate::types::{Pose2D, TrackedObject, Trajectory, Waypoint};

use frenet::{generate_candidates, ReferenceLine};
use grid::OccupancyGrid;
use sampling::RrtPlanner;
use search::{best_first_search, GridSpace, HybridNode, HybridSpace, SearchFailure};

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanningError {
    #[error("{algorithm} exhausted after {iterations} iterations: {reason}")]
    Exhausted {
        algorithm: PlanningAlgorithm,
        iterations: usize,
        reason: String,
    },

    #[error("{algorithm} found no feasible candidate among {evaluated}: {reason}")]
    NoFeasibleCandidate {
        algorithm: PlanningAlgorithm,
        evaluated: usize,
        reason: String,
    },

    #[error("{algorithm} ran out of time after {iterations} iterations")]
    DeadlineExceeded {
        algorithm: PlanningAlgorithm,
        iterations: usize,
    },

    #[error("{algorithm} path became unsafe after smoothing ({violations} waypoints inside the safety margin)")]
    UnsafeAfterSmoothing {
        algorithm: PlanningAlgorithm,
        violations: usize,
    },

    #[error("invalid planning request: {0}")]
    InvalidRequest(String),
}

impl PlanningError {
    /// Human-readable cause, without the algorithm prefix.
    pub fn reason(&self) -> String {
        match self {
            PlanningError::Exhausted { reason, .. } => reason.clone(),
            PlanningError::NoFeasibleCandidate { reason, .. } => reason.clone(),
            PlanningError::DeadlineExceeded { .. } => "time budget exceeded".to_string(),
            PlanningError::UnsafeAfterSmoothing { violations, .. } => {
                format!("{violations} waypoints violate the safety margin")
            }
            PlanningError::InvalidRequest(reason) => reason.clone(),
        }
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the PathPlanner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub algorithm: PlanningAlgorithm,

    /// Occupancy grid cell size in meters (default: 0.5)
    pub grid_resolution: f64,

    /// Grid extent beyond the start/goal bounding box (default: 15.0 m)
    pub grid_padding: f64,

    /// Requests needing a larger grid are rejected (default: 4,000,000)
    pub max_grid_cells: usize,

    /// Minimum clearance between any waypoint and an obstacle's edge (default: 1.0 m)
    pub safety_margin: f64,

    /// Extra grid inflation on top of the safety margin, so smoothing
    /// has room to cut corners (default: 0.75 m)
    pub inflation_buffer: f64,

    /// Distance at which the goal counts as reached (default: 1.0 m)
    pub goal_tolerance: f64,

    /// Node expansions before a graph search gives up (default: 20000)
    pub max_iterations: usize,

    /// Moving-average window in points (default: 5)
    pub smoothing_window: usize,

    /// Spacing used when resampling paths before smoothing (default: 0.5 m)
    pub waypoint_spacing: f64,

    /// Wall-clock budget per plan; needs a context (default: none)
    pub time_budget_ms: Option<u64>,

    // --- Hybrid-A* ---
    /// Road-wheel angles tried per expansion (rad)
    pub steering_samples: Vec<f64>,
    /// Motion primitive length (default: 1.5 m)
    pub hybrid_step: f64,
    pub heading_bins: usize,
    pub steering_penalty: f64,

    // --- RRT / RRT* ---
    /// Tree iterations; RRT* always spends all of them (default: 3000)
    pub tree_iterations: usize,
    pub rrt_step: f64,
    /// Probability of sampling the goal itself (default: 0.1)
    pub goal_bias: f64,
    pub rewire_radius: f64,
    pub seed: u64,

    // --- Frenet ---
    /// Target lateral offsets from the reference line (m)
    pub lateral_offsets: Vec<f64>,
    /// Target speeds as fractions of the cruise speed
    pub speed_factors: Vec<f64>,
    /// Candidate duration (default: 5.0 s)
    pub horizon: f64,
    pub sample_dt: f64,
    pub jerk_weight: f64,
    pub lateral_weight: f64,
    pub speed_weight: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            algorithm: PlanningAlgorithm::AStar,
            grid_resolution: 0.5,
            grid_padding: 15.0,
            max_grid_cells: 4_000_000,
            safety_margin: 1.0,
            inflation_buffer: 0.75,
            goal_tolerance: 1.0,
            max_iterations: 20_000,
            smoothing_window: 5,
            waypoint_spacing: 0.5,
            time_budget_ms: None,
            steering_samples: vec![-0.5, -0.25, 0.0, 0.25, 0.5],
            hybrid_step: 1.5,
            heading_bins: 36,
            steering_penalty: 0.5,
            tree_iterations: 3_000,
            rrt_step: 1.5,
            goal_bias: 0.1,
            rewire_radius: 4.0,
            seed: 7,
            lateral_offsets: vec![-3.5, -1.75, 0.0, 1.75, 3.5],
            speed_factors: vec![0.6, 0.8, 1.0],
            horizon: 5.0,
            sample_dt: 0.2,
            jerk_weight: 0.1,
            lateral_weight: 1.0,
            speed_weight: 1.0,
        }
    }
}

impl PlannerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("planner.grid_resolution", self.grid_resolution)?;
        require_non_negative("planner.grid_padding", self.grid_padding)?;
        require_non_negative("planner.safety_margin", self.safety_margin)?;
        require_non_negative("planner.inflation_buffer", self.inflation_buffer)?;
        require_positive("planner.goal_tolerance", self.goal_tolerance)?;
        require_positive("planner.waypoint_spacing", self.waypoint_spacing)?;
        require_positive("planner.hybrid_step", self.hybrid_step)?;
        require_positive("planner.rrt_step", self.rrt_step)?;
        require_positive("planner.rewire_radius", self.rewire_radius)?;
        require_positive("planner.horizon", self.horizon)?;
        require_positive("planner.sample_dt", self.sample_dt)?;
        require_unit_interval("planner.goal_bias", self.goal_bias)?;
        if self.max_grid_cells == 0 {
            return Err(ConfigError::Invalid("planner.max_grid_cells must be at least 1".into()));
        }
        if self.max_iterations == 0 || self.tree_iterations == 0 {
            return Err(ConfigError::Invalid("planner iteration budgets must be at least 1".into()));
        }
        if self.steering_samples.is_empty() || self.heading_bins == 0 {
            return Err(ConfigError::Invalid(
                "planner needs steering samples and heading bins".into(),
            ));
        }
        if self.lateral_offsets.is_empty() || self.speed_factors.is_empty() {
            return Err(ConfigError::Invalid(
                "planner needs lateral offsets and speed factors".into(),
            ));
        }
        Ok(())
    }

    fn time_budget(&self) -> Option<Duration> {
        self.time_budget_ms.map(Duration::from_millis)
    }
}

// ============================================================================
// REQUEST
// ============================================================================

/// Circular obstacle footprint in the planning plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Obstacle {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
}

impl Obstacle {
    pub fn new(x: f64, y: f64, radius: f64) -> Self {
        Self { x, y, radius }
    }

    /// Footprint of a tracked object, sized by its class.
    pub fn from_tracked(object: &TrackedObject) -> Self {
        Self::new(object.position.x, object.position.y, object.class.footprint_radius())
    }

    /// Distance from (x, y) to the obstacle's edge; negative inside.
    pub fn clearance(&self, x: f64, y: f64) -> f64 {
        (x - self.x).hypot(y - self.y) - self.radius
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub start: Pose2D,
    pub goal: Pose2D,
    pub start_speed: f64,
    /// Speed the profile aims for on straight stretches
    pub cruise_speed: f64,
    pub obstacles: Vec<Obstacle>,
    /// Centerline for Frenet sampling; defaults to start → goal
    pub reference_line: Option<Vec<Vector2<f64>>>,
}

impl PlanRequest {
    pub fn new(start: Pose2D, goal: Pose2D) -> Self {
        Self {
            start,
            goal,
            start_speed: 0.0,
            cruise_speed: 10.0,
            obstacles: Vec::new(),
            reference_line: None,
        }
    }

    pub fn with_obstacles(mut self, obstacles: Vec<Obstacle>) -> Self {
        self.obstacles = obstacles;
        self
    }

    pub fn with_speeds(mut self, start_speed: f64, cruise_speed: f64) -> Self {
        self.start_speed = start_speed;
        self.cruise_speed = cruise_speed;
        self
    }

    pub fn with_reference_line(mut self, line: Vec<Vector2<f64>>) -> Self {
        self.reference_line = Some(line);
        self
    }

    fn check(&self) -> Result<(), PlanningError> {
        if !self.start.is_finite() || !self.goal.is_finite() {
            return Err(PlanningError::InvalidRequest("start and goal must be finite".into()));
        }
        if !(self.start_speed.is_finite() && self.start_speed >= 0.0)
            || !(self.cruise_speed.is_finite() && self.cruise_speed >= 0.0)
        {
            return Err(PlanningError::InvalidRequest(
                "speeds must be finite and non-negative".into(),
            ));
        }
        if self
            .obstacles
            .iter()
            .any(|o| !(o.x.is_finite() && o.y.is_finite() && o.radius.is_finite() && o.radius >= 0.0))
        {
            return Err(PlanningError::InvalidRequest("obstacle with non-finite geometry".into()));
        }
        Ok(())
    }
}

/// Number of waypoints closer to some obstacle edge than `margin`.
pub fn count_violations(waypoints: &[Waypoint], obstacles: &[Obstacle], margin: f64) -> usize {
    waypoints
        .iter()
        .filter(|wp| obstacles.iter().any(|o| o.clearance(wp.x, wp.y) < margin))
        .count()
}

// ============================================================================
// PATH PLANNER (The Main Engine)
// ============================================================================

pub struct PathPlanner {
    config: PlannerConfig,
    vehicle: VehicleConfig,
    context: Option<Arc<dyn PilotContext>>,
}

impl std::fmt::Debug for PathPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathPlanner")
            .field("algorithm", &self.config.algorithm)
            .field("has_context", &self.context.is_some())
            .finish()
    }
}

impl PathPlanner {
    pub fn new(config: PlannerConfig, vehicle: VehicleConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        vehicle.validate()?;
        Ok(Self {
            config,
            vehicle,
            context: None,
        })
    }

    pub fn with_defaults() -> Self {
        Self {
            config: PlannerConfig::default(),
            vehicle: VehicleConfig::default(),
            context: None,
        }
    }

    /// Attach a clock so `time_budget_ms` can be enforced.
    pub fn with_context(mut self, context: Arc<dyn PilotContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn algorithm(&self) -> PlanningAlgorithm {
        self.config.algorithm
    }

    pub fn set_algorithm(&mut self, algorithm: PlanningAlgorithm) {
        self.config.algorithm = algorithm;
    }

    /// Plan a trajectory from `request.start` to `request.goal`.
    pub fn plan(&self, request: &PlanRequest) -> Result<Trajectory, PlanningError> {
        request.check()?;
        let algorithm = self.config.algorithm;
        let deadline = Deadline::optional(self.context.as_deref(), self.config.time_budget());

        // Frenet candidates are checked against the bare safety margin, the
        // graph planners get an extra buffer for smoothing
        let inflation = match algorithm {
            PlanningAlgorithm::Frenet => self.config.safety_margin,
            _ => self.config.safety_margin + self.config.inflation_buffer,
        };
        let grid = OccupancyGrid::build(
            &request.start,
            &request.goal,
            &request.obstacles,
            self.config.grid_resolution,
            self.config.grid_padding,
            inflation,
            self.config.max_grid_cells,
        )?;
        debug!(
            %algorithm,
            width = grid.width(),
            height = grid.height(),
            occupied = grid.occupied_count(),
            "occupancy grid built"
        );

        let trajectory = match algorithm {
            PlanningAlgorithm::Frenet => self.plan_frenet(&grid, request)?,
            _ => {
                if !grid.is_free_world(request.goal.x, request.goal.y) {
                    return Err(PlanningError::Exhausted {
                        algorithm,
                        iterations: 0,
                        reason: "goal lies inside an inflated obstacle".to_string(),
                    });
                }
                let (points, cost) = match algorithm {
                    PlanningAlgorithm::AStar => self.search_grid(&grid, request, &deadline)?,
                    PlanningAlgorithm::HybridAStar => self.search_hybrid(&grid, request, &deadline)?,
                    PlanningAlgorithm::Rrt => self.grow_tree(&grid, request, false, &deadline)?,
                    _ => self.grow_tree(&grid, request, true, &deadline)?,
                };
                self.finalize_path(&points, request, cost)
            }
        };

        let mut trajectory = trajectory;
        if !self.validate(&mut trajectory, &request.obstacles) {
            let violations = count_violations(
                &trajectory.waypoints,
                &request.obstacles,
                self.config.safety_margin,
            );
            warn!(%algorithm, violations, "smoothed path violates the safety margin");
            return Err(PlanningError::UnsafeAfterSmoothing {
                algorithm,
                violations,
            });
        }

        info!(
            %algorithm,
            waypoints = trajectory.len(),
            length = trajectory.length,
            cost = trajectory.cost,
            feasible = trajectory.feasible,
            "trajectory planned"
        );
        Ok(trajectory)
    }

    /// Re-check a trajectory against `obstacles` and update its `safe` flag.
    pub fn validate(&self, trajectory: &mut Trajectory, obstacles: &[Obstacle]) -> bool {
        trajectory.safe =
            count_violations(&trajectory.waypoints, obstacles, self.config.safety_margin) == 0;
        trajectory.safe
    }

    fn search_error(&self, failure: SearchFailure) -> PlanningError {
        let algorithm = self.config.algorithm;
        match failure {
            SearchFailure::Exhausted { iterations } => PlanningError::Exhausted {
                algorithm,
                iterations,
                reason: format!("iteration budget of {iterations} spent"),
            },
            SearchFailure::Unreachable { iterations } => PlanningError::Exhausted {
                algorithm,
                iterations,
                reason: "search space exhausted without reaching the goal".to_string(),
            },
            SearchFailure::DeadlineExceeded { iterations } => PlanningError::DeadlineExceeded {
                algorithm,
                iterations,
            },
        }
    }

    fn search_grid(
        &self,
        grid: &OccupancyGrid,
        request: &PlanRequest,
        deadline: &Deadline<'_>,
    ) -> Result<(Vec<(f64, f64)>, f64), PlanningError> {
        let goal = (request.goal.x, request.goal.y);
        let space = GridSpace {
            grid,
            goal,
            goal_tolerance: self.config.goal_tolerance,
        };
        let start_cell = grid.world_to_cell(request.start.x, request.start.y);
        let result = best_first_search(&space, start_cell, self.config.max_iterations, deadline)
            .map_err(|f| self.search_error(f))?;
        debug!(iterations = result.iterations, cost = result.cost, "grid search finished");

        let mut points: Vec<(f64, f64)> = result
            .path
            .iter()
            .map(|&(i, j)| grid.cell_center(i, j))
            .collect();
        if let Some(first) = points.first_mut() {
            *first = (request.start.x, request.start.y);
        }
        Self::close_on_goal(grid, &mut points, goal);
        Ok((points, result.cost))
    }

    fn search_hybrid(
        &self,
        grid: &OccupancyGrid,
        request: &PlanRequest,
        deadline: &Deadline<'_>,
    ) -> Result<(Vec<(f64, f64)>, f64), PlanningError> {
        let limit = self.vehicle.max_steering_angle;
        let mut steering: Vec<f64> = self
            .config
            .steering_samples
            .iter()
            .map(|s| s.clamp(-limit, limit))
            .collect();
        steering.sort_by(f64::total_cmp);
        steering.dedup();

        let goal = (request.goal.x, request.goal.y);
        let space = HybridSpace {
            grid,
            goal,
            goal_tolerance: self.config.goal_tolerance,
            wheelbase: self.vehicle.wheelbase,
            steering_samples: steering,
            step: self.config.hybrid_step,
            heading_bins: self.config.heading_bins,
            steering_penalty: self.config.steering_penalty,
        };
        let start = HybridNode {
            x: request.start.x,
            y: request.start.y,
            heading: request.start.heading,
        };
        let result = best_first_search(&space, start, self.config.max_iterations, deadline)
            .map_err(|f| self.search_error(f))?;
        debug!(iterations = result.iterations, cost = result.cost, "hybrid search finished");

        let mut points: Vec<(f64, f64)> = result.path.iter().map(|n| (n.x, n.y)).collect();
        Self::close_on_goal(grid, &mut points, goal);
        Ok((points, result.cost))
    }

    fn grow_tree(
        &self,
        grid: &OccupancyGrid,
        request: &PlanRequest,
        optimize: bool,
        deadline: &Deadline<'_>,
    ) -> Result<(Vec<(f64, f64)>, f64), PlanningError> {
        let mut rrt = RrtPlanner::new(
            grid,
            self.config.rrt_step,
            self.config.goal_bias,
            self.config.rewire_radius,
            self.config.goal_tolerance,
            self.config.seed,
        );
        let result = rrt
            .plan(
                (request.start.x, request.start.y),
                (request.goal.x, request.goal.y),
                optimize,
                self.config.tree_iterations,
                deadline,
            )
            .map_err(|f| self.search_error(f))?;
        debug!(
            iterations = result.iterations,
            tree_size = result.tree_size,
            cost = result.cost,
            "tree search finished"
        );
        Ok((result.path, result.cost))
    }

    /// Append the exact goal when the search stopped within tolerance.
    fn close_on_goal(grid: &OccupancyGrid, points: &mut Vec<(f64, f64)>, goal: (f64, f64)) {
        if let Some(&last) = points.last() {
            let gap = (last.0 - goal.0).hypot(last.1 - goal.1);
            if gap > 1e-9 && grid.segment_free(last, goal) {
                points.push(goal);
            }
        }
    }

    fn finalize_path(&self, points: &[(f64, f64)], request: &PlanRequest, cost: f64) -> Trajectory {
        let dense = smoothing::resample(points, self.config.waypoint_spacing);
        let smoothed = smoothing::moving_average(&dense, self.config.smoothing_window);

        let mut waypoints: Vec<Waypoint> = smoothed
            .iter()
            .map(|&(x, y)| Waypoint::new(x, y, request.start.heading, 0.0))
            .collect();
        smoothing::annotate_geometry(&mut waypoints);
        smoothing::velocity_profile(
            &mut waypoints,
            request.start_speed,
            request.cruise_speed,
            &self.vehicle,
            true,
        );

        let mut trajectory = Trajectory::from_waypoints(waypoints, cost);
        trajectory.feasible = self.is_feasible(&trajectory);
        trajectory
    }

    fn is_feasible(&self, trajectory: &Trajectory) -> bool {
        let max_curvature = self.vehicle.max_curvature() + 1e-9;
        trajectory.waypoints.iter().all(|wp| {
            wp.curvature.abs() <= max_curvature
                && wp.velocity <= self.vehicle.max_speed + 1e-9
                && wp.acceleration.map_or(true, |a| {
                    a <= self.vehicle.max_acceleration + 1e-9
                        && a >= -self.vehicle.max_deceleration - 1e-9
                })
        })
    }

    fn plan_frenet(&self, grid: &OccupancyGrid, request: &PlanRequest) -> Result<Trajectory, PlanningError> {
        let algorithm = PlanningAlgorithm::Frenet;
        let reference = match &request.reference_line {
            Some(points) => ReferenceLine::new(points.clone()),
            None if request.start.distance_to(&request.goal) > 1e-6 => ReferenceLine::new(vec![
                Vector2::new(request.start.x, request.start.y),
                Vector2::new(request.goal.x, request.goal.y),
            ]),
            None => ReferenceLine::along_heading(&request.start, 10.0),
        }
        .ok_or_else(|| {
            PlanningError::InvalidRequest("reference line needs two distinct finite points".into())
        })?;

        let (goal_station, _) = reference.project(request.goal.x, request.goal.y);
        let (start_station, _) = reference.project(request.start.x, request.start.y);
        let stop_station = (goal_station > start_station).then_some(goal_station);

        let candidates = generate_candidates(
            &reference,
            &request.start,
            request.start_speed,
            request.cruise_speed,
            stop_station,
            &self.config,
            &self.vehicle,
        )
        .map_err(|e| PlanningError::InvalidRequest(format!("frenet polynomial: {e}")))?;

        let evaluated = candidates.len();
        let mut infeasible = 0;
        let mut unsafe_count = 0;
        let mut best: Option<Trajectory> = None;

        for candidate in candidates {
            if !candidate.feasible {
                infeasible += 1;
                continue;
            }
            let clear = candidate.trajectory.waypoints.iter().all(|wp| {
                (!grid.contains(wp.x, wp.y) || grid.is_free_world(wp.x, wp.y))
                    && request
                        .obstacles
                        .iter()
                        .all(|o| o.clearance(wp.x, wp.y) >= self.config.safety_margin)
            });
            if !clear {
                unsafe_count += 1;
                continue;
            }
            if best.as_ref().map_or(true, |b| candidate.cost < b.cost) {
                best = Some(candidate.trajectory);
            }
        }

        let Some(mut trajectory) = best else {
            return Err(PlanningError::NoFeasibleCandidate {
                algorithm,
                evaluated,
                reason: format!("{infeasible} violate vehicle limits, {unsafe_count} collide"),
            });
        };
        debug!(evaluated, infeasible, unsafe_count, cost = trajectory.cost, "frenet candidate selected");

        // Smooth positions only; timing and speeds come from the polynomials
        let points: Vec<(f64, f64)> = trajectory.waypoints.iter().map(|w| (w.x, w.y)).collect();
        let smoothed = smoothing::moving_average(&points, self.config.smoothing_window);
        for (wp, (x, y)) in trajectory.waypoints.iter_mut().zip(smoothed) {
            wp.x = x;
            wp.y = y;
        }
        smoothing::annotate_geometry(&mut trajectory.waypoints);
        trajectory.length = trajectory
            .waypoints
            .windows(2)
            .map(|w| w[0].distance_to(w[1].x, w[1].y))
            .sum();
        trajectory.feasible = self.is_feasible(&trajectory);
        Ok(trajectory)
    }
}

impl Default for PathPlanner {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_env::SystemContext;

    fn detour_request() -> PlanRequest {
        PlanRequest::new(Pose2D::new(0.0, 0.0, 0.0), Pose2D::new(30.0, 0.0, 0.0))
            .with_obstacles(vec![Obstacle::new(15.0, 0.0, 1.5)])
            .with_speeds(5.0, 8.0)
    }

    fn planner(algorithm: PlanningAlgorithm) -> PathPlanner {
        PathPlanner::new(
            PlannerConfig {
                algorithm,
                ..PlannerConfig::default()
            },
            VehicleConfig::default(),
        )
        .unwrap()
    }

    fn assert_clear(trajectory: &Trajectory, request: &PlanRequest, margin: f64) {
        for wp in &trajectory.waypoints {
            for o in &request.obstacles {
                assert!(
                    o.clearance(wp.x, wp.y) >= margin,
                    "waypoint ({:.2}, {:.2}) too close to obstacle",
                    wp.x,
                    wp.y
                );
            }
        }
    }

    #[test]
    fn test_graph_and_tree_planners_avoid_obstacle() {
        let request = detour_request();
        for algorithm in [
            PlanningAlgorithm::AStar,
            PlanningAlgorithm::HybridAStar,
            PlanningAlgorithm::Rrt,
            PlanningAlgorithm::RrtStar,
        ] {
            let trajectory = planner(algorithm)
                .plan(&request)
                .unwrap_or_else(|e| panic!("{algorithm} failed: {e}"));

            assert!(trajectory.safe, "{algorithm}");
            assert!(!trajectory.is_empty());
            assert_eq!(trajectory.times.len(), trajectory.len());
            assert!(trajectory.times.windows(2).all(|w| w[1] >= w[0]));
            assert_clear(&trajectory, &request, 1.0);

            let first = trajectory.waypoints[0];
            assert!(first.distance_to(0.0, 0.0) < 1e-6, "{algorithm} start moved");
        }
    }

    #[test]
    fn test_graph_planners_end_at_goal() {
        let request = detour_request();
        for algorithm in [
            PlanningAlgorithm::AStar,
            PlanningAlgorithm::HybridAStar,
            PlanningAlgorithm::Rrt,
            PlanningAlgorithm::RrtStar,
        ] {
            let trajectory = planner(algorithm).plan(&request).unwrap();
            let last = trajectory.last().unwrap();
            assert!(last.distance_to(30.0, 0.0) <= 1.0, "{algorithm}");
            assert_eq!(last.velocity, 0.0);
        }
    }

    #[test]
    fn test_frenet_swerves_around_obstacle() {
        let request = PlanRequest::new(Pose2D::new(0.0, 0.0, 0.0), Pose2D::new(60.0, 0.0, 0.0))
            .with_obstacles(vec![Obstacle::new(35.0, 0.0, 1.5)])
            .with_speeds(10.0, 10.0);
        let trajectory = planner(PlanningAlgorithm::Frenet).plan(&request).unwrap();

        assert!(trajectory.safe);
        assert!(trajectory.feasible);
        assert_clear(&trajectory, &request, 1.0);
        assert!(trajectory.last().unwrap().y.abs() > 3.0);
        assert!(trajectory.duration > 4.9);
    }

    #[test]
    fn test_frenet_keeps_lane_when_clear() {
        let request = PlanRequest::new(Pose2D::new(0.0, 0.0, 0.0), Pose2D::new(100.0, 0.0, 0.0))
            .with_speeds(8.0, 10.0);
        let trajectory = planner(PlanningAlgorithm::Frenet).plan(&request).unwrap();

        assert!(trajectory.waypoints.iter().all(|w| w.y.abs() < 1e-6));
        assert!((trajectory.last().unwrap().velocity - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_goal_inside_obstacle_is_exhausted() {
        let request = PlanRequest::new(Pose2D::new(0.0, 0.0, 0.0), Pose2D::new(20.0, 0.0, 0.0))
            .with_obstacles(vec![Obstacle::new(20.0, 0.0, 2.0)]);
        let err = planner(PlanningAlgorithm::AStar).plan(&request).unwrap_err();

        assert!(matches!(err, PlanningError::Exhausted { .. }));
        assert!(err.reason().contains("goal"));
    }

    #[test]
    fn test_iteration_budget_exhaustion() {
        let planner = PathPlanner::new(
            PlannerConfig {
                max_iterations: 5,
                ..PlannerConfig::default()
            },
            VehicleConfig::default(),
        )
        .unwrap();
        let err = planner.plan(&detour_request()).unwrap_err();

        assert!(matches!(err, PlanningError::Exhausted { iterations: 5, .. }));
    }

    #[test]
    fn test_frenet_no_feasible_candidate() {
        // Wall of obstacles across every lateral offset
        let obstacles = (-8..=8).map(|k| Obstacle::new(20.0, k as f64, 1.0)).collect();
        let request = PlanRequest::new(Pose2D::new(0.0, 0.0, 0.0), Pose2D::new(60.0, 0.0, 0.0))
            .with_obstacles(obstacles)
            .with_speeds(10.0, 10.0);
        let err = planner(PlanningAlgorithm::Frenet).plan(&request).unwrap_err();

        match err {
            PlanningError::NoFeasibleCandidate { evaluated, .. } => assert_eq!(evaluated, 15),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_zero_time_budget_hits_deadline() {
        let planner = PathPlanner::new(
            PlannerConfig {
                time_budget_ms: Some(0),
                ..PlannerConfig::default()
            },
            VehicleConfig::default(),
        )
        .unwrap()
        .with_context(SystemContext::shared());
        let err = planner.plan(&detour_request()).unwrap_err();

        assert!(matches!(err, PlanningError::DeadlineExceeded { .. }));
    }

    #[test]
    fn test_far_goal_rejected_by_grid_cap() {
        let request = PlanRequest::new(Pose2D::new(0.0, 0.0, 0.0), Pose2D::new(1e10, 1e10, 0.0));
        for algorithm in PlanningAlgorithm::all() {
            let planner = PathPlanner::new(
                PlannerConfig {
                    algorithm: *algorithm,
                    ..PlannerConfig::default()
                },
                VehicleConfig::default(),
            )
            .unwrap();
            assert!(
                matches!(planner.plan(&request), Err(PlanningError::InvalidRequest(_))),
                "{algorithm}"
            );
        }
    }

    #[test]
    fn test_invalid_request_rejected() {
        let request = PlanRequest::new(Pose2D::new(f64::NAN, 0.0, 0.0), Pose2D::new(1.0, 0.0, 0.0));
        assert!(matches!(
            PathPlanner::with_defaults().plan(&request),
            Err(PlanningError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_validate_flags_new_obstacle() {
        let planner = PathPlanner::with_defaults();
        let mut trajectory = Trajectory::straight_line(0.0, 0.0, 0.0, 20.0, 1.0, 5.0);

        assert!(planner.validate(&mut trajectory, &[]));
        assert!(!planner.validate(&mut trajectory, &[Obstacle::new(10.0, 0.5, 1.0)]));
        assert!(!trajectory.safe);
    }
}
