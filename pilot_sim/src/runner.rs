//! Scenario runner - closes the loop between the oracle and the pilot stack.

use nalgebra::Vector2;
use pilot_core::types::LightState;
use pilot_core::validation::{ValidationReport, ValidationSession};
use pilot_core::{BehaviorState, ControlAlgorithm, PilotAgent, PilotConfig, PlanningAlgorithm, TickInput};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::context::SimContext;
use crate::error::SimError;
use crate::oracle::Oracle;
use crate::scenarios::{Scenario, ScenarioId};

/// Length of the route laid along the starting lane (m).
const ROUTE_LENGTH: f64 = 2000.0;

/// Lane offset is judged only after this much time (s).
const SETTLE_TIME: f64 = 5.0;

/// Results from running a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,

    /// Tracker and controller error against ground truth
    pub validation: ValidationReport,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioMetrics {
    /// Smallest box clearance between the ego and any actor (m)
    pub min_clearance: Option<f64>,

    pub collided: bool,

    /// Largest ego offset from its lane centre after settling (m)
    pub max_settled_lane_offset: f64,

    pub final_lane_offset: f64,
    pub final_lane: usize,
    pub final_x: f64,
    pub final_speed: f64,

    pub plans: u64,
    pub planning_failures: u64,
    pub emergency_stops: u64,

    /// Behavior states entered at least once, sorted
    pub states_visited: Vec<String>,

    /// Times the ego crossed a light's stop position on red
    pub red_light_violations: u32,

    pub final_track_count: usize,
}

impl ScenarioMetrics {
    pub fn visited(&self, state: BehaviorState) -> bool {
        self.states_visited.iter().any(|s| s == state.name())
    }
}

/// Runs driving scenarios against a fresh pilot stack.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Tick rate in Hz
    tick_rate_hz: u32,

    /// Overrides each scenario's own duration
    duration_secs: Option<f64>,

    config: PilotConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            tick_rate_hz: 10,
            duration_secs: None,
            config: PilotConfig::default(),
        }
    }

    /// Sets the tick rate.
    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.tick_rate_hz = hz.max(1);
        self
    }

    /// Sets the duration for every scenario.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = Some(secs);
        self
    }

    pub fn with_config(mut self, config: PilotConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_planner(mut self, algorithm: PlanningAlgorithm) -> Self {
        self.config.planner.algorithm = algorithm;
        self
    }

    pub fn with_controller(mut self, algorithm: ControlAlgorithm) -> Self {
        self.config.controller.algorithm = algorithm;
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, id: ScenarioId) -> Result<ScenarioResult, SimError> {
        info!(
            scenario = id.name(),
            seed = self.seed,
            planner = %self.config.planner.algorithm,
            controller = %self.config.controller.algorithm,
            "starting scenario"
        );

        let scenario = id.build();
        let context = SimContext::shared(self.seed);
        let mut oracle = scenario.spawn(context.physics_seed(), self.config.vehicle.clone());

        let lane = scenario.start_lane_center();
        let route = vec![
            Vector2::new(scenario.ego.x, lane),
            Vector2::new(scenario.ego.x + ROUTE_LENGTH, lane),
        ];
        let mut agent = PilotAgent::new(context.clone(), self.config.clone())?.with_route(route)?;
        let mut session = ValidationSession::new();

        let dt = 1.0 / self.tick_rate_hz as f64;
        let duration = self.duration_secs.unwrap_or(scenario.duration).max(0.0);
        let target_ticks = (duration * self.tick_rate_hz as f64).round() as u64;

        let mut metrics = ScenarioMetrics::default();
        let mut visited: BTreeSet<&'static str> = BTreeSet::new();
        let mut final_track_count = 0;

        for tick in 0..target_ticks {
            let ego = oracle.ego_state();
            let batches = oracle.sense();
            let map = oracle.map_context();
            let output = agent.tick(&TickInput {
                ego: &ego,
                batches: &batches,
                map: &map,
                mission: scenario.mission,
                lane_offset: oracle.lane_offset(),
            });

            session.record_frame(&oracle.ground_truth(), &output.tracks);
            session.record_control(&output.command.error);
            visited.insert(output.decision.state.name());
            final_track_count = output.tracks.len();

            // Advance physics
            let before = oracle.ego().x;
            let time = oracle.time();
            oracle.apply_control(&output.command);
            oracle.step(dt);
            context.advance_time(Duration::from_secs_f64(dt));

            let after = oracle.ego().x;
            for light in oracle.lights() {
                if before < light.x && after >= light.x && light.state_at(time) != LightState::Green {
                    warn!(x = light.x, time, "ego crossed a red light");
                    metrics.red_light_violations += 1;
                }
            }
            if let Some((actor, clearance)) = oracle.min_clearance() {
                if metrics.min_clearance.map_or(true, |c| clearance < c) {
                    metrics.min_clearance = Some(clearance);
                }
                if clearance < 0.0 && !metrics.collided {
                    warn!(actor, time = oracle.time(), "ego collided");
                    metrics.collided = true;
                }
            }
            if oracle.time() >= SETTLE_TIME {
                metrics.max_settled_lane_offset = metrics.max_settled_lane_offset.max(oracle.lane_offset().abs());
            }

            // Progress log once per simulated second
            if tick % u64::from(self.tick_rate_hz) == 0 {
                debug!(
                    t = oracle.time(),
                    x = oracle.ego().x,
                    y = oracle.ego().y,
                    speed = oracle.ego().speed,
                    state = %output.decision.state,
                    tracks = output.tracks.len(),
                    "scenario progress"
                );
            }
        }

        let stats = agent.stats();
        metrics.final_lane_offset = oracle.lane_offset();
        metrics.final_lane = oracle.ego_lane();
        metrics.final_x = oracle.ego().x;
        metrics.final_speed = oracle.ego().speed;
        metrics.plans = stats.plans;
        metrics.planning_failures = stats.planning_failures;
        metrics.emergency_stops = stats.emergency_stops;
        metrics.states_visited = visited.into_iter().map(str::to_string).collect();
        metrics.final_track_count = final_track_count;

        let validation = session.generate_report();
        let verdict = self.evaluate(&scenario, &oracle, &metrics, &validation);

        info!(
            scenario = id.name(),
            passed = verdict.is_ok(),
            final_x = metrics.final_x,
            final_speed = metrics.final_speed,
            min_clearance = ?metrics.min_clearance,
            track_rmse = validation.global.position_rmse(),
            plans = metrics.plans,
            "scenario complete"
        );

        Ok(ScenarioResult {
            scenario: id,
            seed: self.seed,
            passed: verdict.is_ok(),
            total_ticks: target_ticks,
            final_time_secs: oracle.time(),
            failure_reason: verdict.err(),
            metrics,
            validation,
        })
    }

    /// Pass criteria per scenario.
    fn evaluate(
        &self,
        scenario: &Scenario,
        oracle: &Oracle,
        m: &ScenarioMetrics,
        report: &ValidationReport,
    ) -> Result<(), String> {
        if m.collided {
            return Err(format!(
                "collision (min clearance {:.2}m)",
                m.min_clearance.unwrap_or_default()
            ));
        }
        let first_actor = oracle.actors().first();

        match scenario.id {
            ScenarioId::StraightCruise => {
                let cruise = self.config.behavior.cruise_speed;
                require(m.max_settled_lane_offset < 0.5, || {
                    format!("lane offset {:.2}m after {SETTLE_TIME}s", m.max_settled_lane_offset)
                })?;
                require((m.final_speed - cruise).abs() <= 1.0, || {
                    format!("final speed {:.1} m/s, cruise is {cruise:.1} m/s", m.final_speed)
                })
            }
            ScenarioId::FollowLead => {
                let lead = first_actor.ok_or("lead vehicle missing")?;
                let gap = lead.position.x - m.final_x;
                require((10.0..=45.0).contains(&gap), || format!("following gap {gap:.1}m"))?;
                require((m.final_speed - lead.speed).abs() < 1.5, || {
                    format!("speed {:.1} m/s vs lead {:.1} m/s", m.final_speed, lead.speed)
                })
            }
            ScenarioId::LeadBrake => require(m.final_speed < 0.5, || {
                format!("still moving at {:.1} m/s behind a stopped lead", m.final_speed)
            }),
            ScenarioId::PedestrianCrossing => {
                let pedestrian = first_actor.ok_or("pedestrian missing")?;
                require(m.visited(BehaviorState::Emergency), || "never yielded to the pedestrian".to_string())?;
                require(m.min_clearance.is_some_and(|c| c >= 1.0), || {
                    format!("passed within {:.2}m of the pedestrian", m.min_clearance.unwrap_or_default())
                })?;
                require(m.final_x > pedestrian.position.x, || "did not resume after the crossing".to_string())
            }
            ScenarioId::RedLight => {
                let light_x = oracle.lights().first().map_or(0.0, |l| l.x);
                require(m.red_light_violations == 0, || "ran a red light".to_string())?;
                require(m.visited(BehaviorState::Stop), || "never stopped for the light".to_string())?;
                require(m.final_x > light_x + 10.0, || {
                    format!("stuck at x={:.1} after the light turned green", m.final_x)
                })
            }
            ScenarioId::SlowLead => {
                let lead = first_actor.ok_or("lead vehicle missing")?;
                require(m.final_lane == 1, || format!("ended in lane {}", m.final_lane))?;
                require(m.final_x > lead.position.x + 10.0, || "did not pass the slow lead".to_string())
            }
            ScenarioId::ObstacleDetour => {
                let obstacle = first_actor.ok_or("obstacle missing")?;
                require(m.final_x > obstacle.position.x + 10.0, || {
                    format!("stuck at x={:.1} behind the obstacle", m.final_x)
                })
            }
            ScenarioId::SensorFusion => {
                let actors = oracle.actors().len();
                require(m.final_track_count == actors, || {
                    format!("{} tracks for {actors} vehicles", m.final_track_count)
                })?;
                require(report.id_switches == 0, || format!("{} identity switches", report.id_switches))?;
                require(report.passes_criteria(1.0, 0.9, 0.05), || {
                    format!(
                        "rmse {:.2}m, coverage {:.0}%, ghosts {:.0}%",
                        report.global.position_rmse(),
                        report.coverage * 100.0,
                        report.global.ghost_rate() * 100.0
                    )
                })
            }
        }
    }
}

fn require(condition: bool, reason: impl FnOnce() -> String) -> Result<(), String> {
    if condition {
        Ok(())
    } else {
        Err(reason())
    }
}
