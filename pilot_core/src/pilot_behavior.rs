//! The "BEHAVIOR" Engine - Priority-Ordered Driving Decisions
//!
//! Each tick the arbiter:
//! 1. **Assesses** the scene: lead vehicle, time-to-collision, adjacent-lane
//!    gaps, traffic lights, pedestrians, junctions.
//! 2. **Selects** a state by walking an ordered rule list; the first rule
//!    whose guard holds wins.
//! 3. **Executes** the winning rule's action, which fixes the target speed
//!    and lateral lane offset.
//!
//! Rule order (most urgent first):
//!
//! ```text
//! emergency → traffic_light → lane_change_in_progress → intersection
//!           → mission → merge → lane_change → lane_keep
//! ```
//!
//! Lane-change states (LANE_CHANGE_LEFT/RIGHT, OVERTAKE, MERGE) are only
//! entered when the target side is clear and the ego is slow enough. Once
//! started they continue until `lane_change_timeout`, and are aborted back
//! to LANE_KEEP on any tick where the target side stops being clear.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, info};

use crate::config::{require_non_negative, require_positive, ConfigError};
use crate::types::{LightState, MapContext, ObjectClass, TrackId, TrackedObject, VehicleState};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Speed held on a clear road (m/s, default: 13.9)
    pub cruise_speed: f64,

    /// Adaptive-cruise time headway (s, default: 2.0)
    pub time_headway: f64,

    /// Gap kept to a stopped lead vehicle (m, default: 5.0)
    pub standstill_gap: f64,

    /// Distance from the ego reference point to its front bumper (m)
    pub ego_front_extent: f64,

    /// Objects within this lateral distance of the ego axis count as in-lane
    pub lead_lateral_tolerance: f64,

    /// TTC below which the arbiter declares an emergency (s, default: 2.0)
    pub emergency_ttc: f64,

    /// Pedestrians closer than this force an emergency stop (m)
    pub pedestrian_yield_distance: f64,

    /// Half-width of the corridor pedestrians are watched in (m)
    pub pedestrian_corridor: f64,

    /// Traffic lights further ahead are ignored (m, default: 50.0)
    pub traffic_light_range: f64,

    /// Lights further to the side than this belong to another road (m)
    pub traffic_light_lateral_range: f64,

    /// Smallest gap in the target lane for a lane change (m, default: 20.0)
    pub min_lane_change_gap: f64,

    /// Fastest ego speed a lane change may start at (m/s, default: 20.0)
    pub max_lane_change_speed: f64,

    /// Lane changes finish after this long (s, default: 5.0)
    pub lane_change_timeout: f64,

    /// Lead vehicles closer than this can trigger a lane change (m)
    pub lane_change_trigger_distance: f64,

    /// A lead slower than this fraction of the desired speed triggers a lane change
    pub lane_change_speed_ratio: f64,

    /// A lead slower than this fraction triggers an overtake instead
    pub overtake_speed_ratio: f64,

    /// Junctions closer than this switch to INTERSECTION (m)
    pub intersection_range: f64,

    /// Speed cap through junctions (m/s)
    pub intersection_speed: f64,

    /// Start merging when the lane ends within this distance (m)
    pub merge_range: f64,

    pub pull_over_speed: f64,

    /// Lateral offset toward the shoulder while pulling over (m)
    pub pull_over_offset: f64,

    pub parking_speed: f64,

    /// Transitions kept in the log
    pub transition_log_len: usize,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            cruise_speed: 13.9,
            time_headway: 2.0,
            standstill_gap: 5.0,
            ego_front_extent: 2.0,
            lead_lateral_tolerance: 1.5,
            emergency_ttc: 2.0,
            pedestrian_yield_distance: 15.0,
            pedestrian_corridor: 3.0,
            traffic_light_range: 50.0,
            traffic_light_lateral_range: 10.0,
            min_lane_change_gap: 20.0,
            max_lane_change_speed: 20.0,
            lane_change_timeout: 5.0,
            lane_change_trigger_distance: 40.0,
            lane_change_speed_ratio: 0.8,
            overtake_speed_ratio: 0.5,
            intersection_range: 30.0,
            intersection_speed: 6.0,
            merge_range: 60.0,
            pull_over_speed: 3.0,
            pull_over_offset: 1.5,
            parking_speed: 1.5,
            transition_log_len: 64,
        }
    }
}

impl BehaviorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("behavior.cruise_speed", self.cruise_speed)?;
        require_positive("behavior.time_headway", self.time_headway)?;
        require_non_negative("behavior.standstill_gap", self.standstill_gap)?;
        require_non_negative("behavior.ego_front_extent", self.ego_front_extent)?;
        require_positive("behavior.lead_lateral_tolerance", self.lead_lateral_tolerance)?;
        require_positive("behavior.emergency_ttc", self.emergency_ttc)?;
        require_non_negative("behavior.pedestrian_yield_distance", self.pedestrian_yield_distance)?;
        require_positive("behavior.pedestrian_corridor", self.pedestrian_corridor)?;
        require_positive("behavior.traffic_light_range", self.traffic_light_range)?;
        require_positive("behavior.traffic_light_lateral_range", self.traffic_light_lateral_range)?;
        require_non_negative("behavior.min_lane_change_gap", self.min_lane_change_gap)?;
        require_positive("behavior.max_lane_change_speed", self.max_lane_change_speed)?;
        require_positive("behavior.lane_change_timeout", self.lane_change_timeout)?;
        require_positive("behavior.lane_change_trigger_distance", self.lane_change_trigger_distance)?;
        if !(0.0 < self.overtake_speed_ratio && self.overtake_speed_ratio <= self.lane_change_speed_ratio)
            || self.lane_change_speed_ratio > 1.0
        {
            return Err(ConfigError::Invalid(
                "behavior speed ratios must satisfy 0 < overtake <= lane_change <= 1".to_string(),
            ));
        }
        require_non_negative("behavior.intersection_range", self.intersection_range)?;
        require_positive("behavior.intersection_speed", self.intersection_speed)?;
        require_non_negative("behavior.merge_range", self.merge_range)?;
        require_positive("behavior.pull_over_speed", self.pull_over_speed)?;
        require_non_negative("behavior.pull_over_offset", self.pull_over_offset)?;
        require_positive("behavior.parking_speed", self.parking_speed)?;
        if self.transition_log_len == 0 {
            return Err(ConfigError::Invalid(
                "behavior.transition_log_len must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// STATES & DECISIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BehaviorState {
    #[default]
    Idle,
    LaneKeep,
    LaneChangeLeft,
    LaneChangeRight,
    Overtake,
    Merge,
    Intersection,
    Stop,
    Parking,
    Emergency,
    PullOver,
}

impl BehaviorState {
    pub fn name(&self) -> &'static str {
        match self {
            BehaviorState::Idle => "IDLE",
            BehaviorState::LaneKeep => "LANE_KEEP",
            BehaviorState::LaneChangeLeft => "LANE_CHANGE_LEFT",
            BehaviorState::LaneChangeRight => "LANE_CHANGE_RIGHT",
            BehaviorState::Overtake => "OVERTAKE",
            BehaviorState::Merge => "MERGE",
            BehaviorState::Intersection => "INTERSECTION",
            BehaviorState::Stop => "STOP",
            BehaviorState::Parking => "PARKING",
            BehaviorState::Emergency => "EMERGENCY",
            BehaviorState::PullOver => "PULL_OVER",
        }
    }

    /// States that move the ego into an adjacent lane.
    pub fn is_lane_change(&self) -> bool {
        matches!(
            self,
            BehaviorState::LaneChangeLeft
                | BehaviorState::LaneChangeRight
                | BehaviorState::Overtake
                | BehaviorState::Merge
        )
    }
}

impl fmt::Display for BehaviorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the vehicle has been asked to do beyond following the road.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mission {
    #[default]
    Cruise,
    PullOver,
    Park,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    /// +1 for left, -1 for right (lateral axis points left).
    pub fn sign(self) -> i32 {
        match self {
            Side::Left => 1,
            Side::Right => -1,
        }
    }
}

/// The arbiter's output for one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorDecision {
    pub state: BehaviorState,
    pub target_speed: f64,
    /// Lateral offset from the current lane centre (m, left positive)
    pub target_lane_offset: f64,
    /// Lanes moved since construction or reset (left positive)
    pub lane_index: i32,
    pub reason: String,
    /// Higher is more urgent
    pub priority: u8,
    pub timestamp: f64,
}

impl BehaviorDecision {
    fn initial() -> Self {
        Self {
            state: BehaviorState::Idle,
            target_speed: 0.0,
            target_lane_offset: 0.0,
            lane_index: 0,
            reason: "initial state".to_string(),
            priority: 0,
            timestamp: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: BehaviorState,
    pub to: BehaviorState,
    pub timestamp: f64,
    pub reason: String,
}

/// Everything the arbiter reads in one tick.
#[derive(Debug, Clone, Copy)]
pub struct BehaviorContext<'a> {
    pub ego: &'a VehicleState,
    pub objects: &'a [TrackedObject],
    pub map: &'a MapContext,
    pub mission: Mission,
    /// Ego offset from its lane centre as reported by localization (m)
    pub lane_offset: f64,
    pub timestamp: f64,
}

// ============================================================================
// ASSESSMENT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeadVehicle {
    pub id: TrackId,
    /// Bumper-to-footprint distance (m)
    pub gap: f64,
    /// Lead speed along the ego heading (m/s)
    pub speed: f64,
    /// Ego speed minus lead speed (m/s)
    pub closing_speed: f64,
}

/// Scene summary computed before any rule is evaluated.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub lead: Option<LeadVehicle>,
    pub time_to_collision: Option<f64>,
    /// Free distance in each adjacent lane (infinite when empty)
    pub left_gap: f64,
    pub right_gap: f64,
    pub left_safe: bool,
    pub right_safe: bool,
    /// Nearest red, yellow or green light ahead and its distance
    pub traffic_light: Option<(LightState, f64)>,
    pub nearest_pedestrian: Option<f64>,
    pub junction_distance: Option<f64>,
    pub lane_error: f64,
    /// Cruise speed limited by the posted limit
    pub desired_speed: f64,
    pub ego_speed: f64,
}

impl Assessment {
    pub fn gap(&self, side: Side) -> f64 {
        match side {
            Side::Left => self.left_gap,
            Side::Right => self.right_gap,
        }
    }

    /// Lane change preconditions minus map availability.
    pub fn side_clear(&self, side: Side, config: &BehaviorConfig) -> bool {
        self.gap(side) >= config.min_lane_change_gap && self.ego_speed <= config.max_lane_change_speed
    }

    pub fn side_safe(&self, side: Side) -> bool {
        match side {
            Side::Left => self.left_safe,
            Side::Right => self.right_safe,
        }
    }

    pub fn red_or_yellow_ahead(&self) -> Option<f64> {
        match self.traffic_light {
            Some((LightState::Red | LightState::Yellow, distance)) => Some(distance),
            _ => None,
        }
    }
}

/// Summarize the scene around the ego.
pub fn assess(config: &BehaviorConfig, ctx: &BehaviorContext<'_>) -> Assessment {
    let ego = ctx.ego;
    let lane_width = ctx.map.lane.width;
    let (heading_sin, heading_cos) = ego.heading.sin_cos();

    let mut lead: Option<LeadVehicle> = None;
    let mut left_gap = f64::INFINITY;
    let mut right_gap = f64::INFINITY;
    let mut nearest_pedestrian: Option<f64> = None;

    for object in ctx.objects {
        let (forward, lateral) = ego.to_body_frame(object.position.x, object.position.y);
        let footprint = object.class.footprint_radius();

        if object.class == ObjectClass::Pedestrian {
            let distance = forward.hypot(lateral);
            if forward > -footprint && lateral.abs() <= config.pedestrian_corridor {
                nearest_pedestrian = Some(nearest_pedestrian.map_or(distance, |d: f64| d.min(distance)));
            }
            continue;
        }

        if lateral.abs() <= config.lead_lateral_tolerance {
            if forward > 0.0 {
                let gap = (forward - footprint - config.ego_front_extent).max(0.0);
                if lead.map_or(true, |l| gap < l.gap) {
                    let speed = object.velocity.x * heading_cos + object.velocity.y * heading_sin;
                    lead = Some(LeadVehicle {
                        id: object.id,
                        gap,
                        speed,
                        closing_speed: ego.speed - speed,
                    });
                }
            }
            continue;
        }

        let side_gap = (forward.abs() - footprint - config.ego_front_extent).max(0.0);
        if lateral > 0.5 * lane_width && lateral <= 1.5 * lane_width {
            left_gap = left_gap.min(side_gap);
        } else if lateral < -0.5 * lane_width && lateral >= -1.5 * lane_width {
            right_gap = right_gap.min(side_gap);
        }
    }

    let time_to_collision = lead.and_then(|l| {
        if l.gap <= 0.0 {
            Some(0.0)
        } else if l.closing_speed > 1e-3 {
            Some(l.gap / l.closing_speed)
        } else {
            None
        }
    });

    let traffic_light = ctx
        .map
        .traffic_lights
        .iter()
        .filter_map(|light| {
            let (forward, lateral) = ego.to_body_frame(light.x, light.y);
            (forward > 0.0
                && forward <= config.traffic_light_range
                && lateral.abs() <= config.traffic_light_lateral_range)
                .then_some((light.state, forward))
        })
        .min_by(|a, b| a.1.total_cmp(&b.1));

    let junction_distance = ctx
        .map
        .junctions
        .iter()
        .filter_map(|j| {
            let (forward, lateral) = ego.to_body_frame(j.x, j.y);
            let edge = (forward.hypot(lateral) - j.radius).max(0.0);
            (forward > -j.radius).then_some(edge)
        })
        .min_by(|a, b| a.total_cmp(b));

    let desired_speed = match ctx.map.lane.speed_limit {
        Some(limit) if limit.is_finite() && limit >= 0.0 => config.cruise_speed.min(limit),
        _ => config.cruise_speed,
    };

    let mut assessment = Assessment {
        lead,
        time_to_collision,
        left_gap,
        right_gap,
        left_safe: false,
        right_safe: false,
        traffic_light,
        nearest_pedestrian,
        junction_distance,
        lane_error: ctx.lane_offset,
        desired_speed,
        ego_speed: ego.speed,
    };
    assessment.left_safe = ctx.map.lane.left_available && assessment.side_clear(Side::Left, config);
    assessment.right_safe = ctx.map.lane.right_available && assessment.side_clear(Side::Right, config);
    assessment
}

/// Adaptive cruise: hold `time_headway` to the lead, never above `cap`.
pub fn adaptive_cruise_speed(config: &BehaviorConfig, lead: Option<&LeadVehicle>, cap: f64) -> f64 {
    match lead {
        Some(lead) => ((lead.gap - config.standstill_gap) / config.time_headway).clamp(0.0, cap.max(0.0)),
        None => cap.max(0.0),
    }
}

// ============================================================================
// RULES
// ============================================================================

/// A lane change underway.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Maneuver {
    pub state: BehaviorState,
    pub side: Side,
    pub started_at: f64,
}

/// Inputs shared by every guard and action.
pub struct RuleInput<'a> {
    pub config: &'a BehaviorConfig,
    pub assessment: &'a Assessment,
    pub context: &'a BehaviorContext<'a>,
    pub maneuver: Option<&'a Maneuver>,
}

/// Output of a rule action.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub state: BehaviorState,
    pub target_speed: f64,
    pub target_lane_offset: f64,
    pub side: Option<Side>,
    pub reason: String,
}

impl Selection {
    fn new(state: BehaviorState, target_speed: f64, reason: impl Into<String>) -> Self {
        Self {
            state,
            target_speed,
            target_lane_offset: 0.0,
            side: None,
            reason: reason.into(),
        }
    }

    fn lane_change(state: BehaviorState, side: Side, input: &RuleInput<'_>, reason: impl Into<String>) -> Self {
        let cap = input.assessment.desired_speed.min(input.config.max_lane_change_speed);
        Self {
            state,
            target_speed: cap,
            target_lane_offset: side.sign() as f64 * input.context.map.lane.width,
            side: Some(side),
            reason: reason.into(),
        }
    }
}

pub type Guard = fn(&RuleInput<'_>) -> bool;
pub type Action = fn(&RuleInput<'_>) -> Selection;

pub struct Rule {
    pub name: &'static str,
    pub guard: Guard,
    pub action: Action,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule").field("name", &self.name).finish()
    }
}

fn lane_keep_speed(input: &RuleInput<'_>) -> f64 {
    adaptive_cruise_speed(input.config, input.assessment.lead.as_ref(), input.assessment.desired_speed)
}

fn emergency_guard(input: &RuleInput<'_>) -> bool {
    let a = input.assessment;
    a.time_to_collision.is_some_and(|ttc| ttc < input.config.emergency_ttc)
        || a.nearest_pedestrian.is_some_and(|d| d <= input.config.pedestrian_yield_distance)
}

fn emergency_action(input: &RuleInput<'_>) -> Selection {
    let a = input.assessment;
    let reason = match (a.time_to_collision, a.nearest_pedestrian) {
        (Some(ttc), _) if ttc < input.config.emergency_ttc => format!("time to collision {ttc:.2}s"),
        (_, Some(d)) => format!("pedestrian at {d:.1}m"),
        _ => "emergency".to_string(),
    };
    Selection::new(BehaviorState::Emergency, 0.0, reason)
}

fn traffic_light_guard(input: &RuleInput<'_>) -> bool {
    input.assessment.red_or_yellow_ahead().is_some()
}

fn traffic_light_action(input: &RuleInput<'_>) -> Selection {
    let distance = input.assessment.red_or_yellow_ahead().unwrap_or_default();
    Selection::new(BehaviorState::Stop, 0.0, format!("traffic light at {distance:.1}m"))
}

fn lane_change_in_progress_guard(input: &RuleInput<'_>) -> bool {
    input.maneuver.is_some()
}

fn lane_change_in_progress_action(input: &RuleInput<'_>) -> Selection {
    let Some(maneuver) = input.maneuver else {
        return Selection::new(BehaviorState::LaneKeep, lane_keep_speed(input), "no lane change");
    };
    let elapsed = input.context.timestamp - maneuver.started_at;
    if !input.assessment.side_clear(maneuver.side, input.config) {
        return Selection::new(
            BehaviorState::LaneKeep,
            lane_keep_speed(input),
            format!("{} aborted: target lane closed", maneuver.state),
        );
    }
    Selection::lane_change(
        maneuver.state,
        maneuver.side,
        input,
        format!("{} in progress ({elapsed:.1}s)", maneuver.state),
    )
}

fn intersection_guard(input: &RuleInput<'_>) -> bool {
    input
        .assessment
        .junction_distance
        .is_some_and(|d| d <= input.config.intersection_range)
}

fn intersection_action(input: &RuleInput<'_>) -> Selection {
    let speed = lane_keep_speed(input).min(input.config.intersection_speed);
    let distance = input.assessment.junction_distance.unwrap_or_default();
    Selection::new(BehaviorState::Intersection, speed, format!("junction at {distance:.1}m"))
}

fn mission_guard(input: &RuleInput<'_>) -> bool {
    input.context.mission != Mission::Cruise
}

fn mission_action(input: &RuleInput<'_>) -> Selection {
    let acc = lane_keep_speed(input);
    match input.context.mission {
        Mission::PullOver => Selection {
            target_lane_offset: -input.config.pull_over_offset,
            ..Selection::new(BehaviorState::PullOver, acc.min(input.config.pull_over_speed), "pull over requested")
        },
        Mission::Park => Selection::new(BehaviorState::Parking, acc.min(input.config.parking_speed), "parking requested"),
        Mission::Idle => Selection::new(BehaviorState::Idle, 0.0, "idle requested"),
        Mission::Cruise => Selection::new(BehaviorState::LaneKeep, acc, "cruise"),
    }
}

fn merge_guard(input: &RuleInput<'_>) -> bool {
    let a = input.assessment;
    input
        .context
        .map
        .lane
        .ends_in
        .is_some_and(|d| d <= input.config.merge_range)
        && (a.left_safe || a.right_safe)
}

fn merge_action(input: &RuleInput<'_>) -> Selection {
    let side = if input.assessment.left_safe { Side::Left } else { Side::Right };
    let ends_in = input.context.map.lane.ends_in.unwrap_or_default();
    Selection::lane_change(BehaviorState::Merge, side, input, format!("lane ends in {ends_in:.1}m"))
}

/// The lead is close and slow enough that changing lanes pays off.
fn lane_change_needed<'a>(input: &'a RuleInput<'a>) -> Option<&'a LeadVehicle> {
    let a = input.assessment;
    a.lead.as_ref().filter(|lead| {
        lead.gap <= input.config.lane_change_trigger_distance
            && lead.speed < input.config.lane_change_speed_ratio * a.desired_speed
    })
}

fn lane_change_guard(input: &RuleInput<'_>) -> bool {
    let a = input.assessment;
    lane_change_needed(input).is_some() && (a.left_safe || a.right_safe)
}

fn lane_change_action(input: &RuleInput<'_>) -> Selection {
    let a = input.assessment;
    let lead_speed = lane_change_needed(input).map_or(0.0, |lead| lead.speed);
    if a.left_safe {
        let state = if lead_speed < input.config.overtake_speed_ratio * a.desired_speed {
            BehaviorState::Overtake
        } else {
            BehaviorState::LaneChangeLeft
        };
        Selection::lane_change(state, Side::Left, input, format!("slow lead at {lead_speed:.1}m/s"))
    } else {
        Selection::lane_change(
            BehaviorState::LaneChangeRight,
            Side::Right,
            input,
            format!("slow lead at {lead_speed:.1}m/s"),
        )
    }
}

fn lane_keep_guard(_: &RuleInput<'_>) -> bool {
    true
}

fn lane_keep_action(input: &RuleInput<'_>) -> Selection {
    let reason = match input.assessment.lead {
        Some(lead) => format!("following {} at {:.1}m", lead.id, lead.gap),
        None => "clear road".to_string(),
    };
    Selection::new(BehaviorState::LaneKeep, lane_keep_speed(input), reason)
}

/// The rule list in priority order.
pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule { name: "emergency", guard: emergency_guard, action: emergency_action },
        Rule { name: "traffic_light", guard: traffic_light_guard, action: traffic_light_action },
        Rule {
            name: "lane_change_in_progress",
            guard: lane_change_in_progress_guard,
            action: lane_change_in_progress_action,
        },
        Rule { name: "intersection", guard: intersection_guard, action: intersection_action },
        Rule { name: "mission", guard: mission_guard, action: mission_action },
        Rule { name: "merge", guard: merge_guard, action: merge_action },
        Rule { name: "lane_change", guard: lane_change_guard, action: lane_change_action },
        Rule { name: "lane_keep", guard: lane_keep_guard, action: lane_keep_action },
    ]
}

// ============================================================================
// BEHAVIOR ARBITER (The Main Engine)
// ============================================================================

#[derive(Debug)]
pub struct BehaviorArbiter {
    config: BehaviorConfig,
    rules: Vec<Rule>,
    decision: BehaviorDecision,
    state_entered_at: f64,
    maneuver: Option<Maneuver>,
    transitions: VecDeque<Transition>,
    last_assessment: Option<Assessment>,
}

impl BehaviorArbiter {
    pub fn new(config: BehaviorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    pub fn with_defaults() -> Self {
        Self::build(BehaviorConfig::default())
    }

    fn build(config: BehaviorConfig) -> Self {
        Self {
            config,
            rules: default_rules(),
            decision: BehaviorDecision::initial(),
            state_entered_at: 0.0,
            maneuver: None,
            transitions: VecDeque::new(),
            last_assessment: None,
        }
    }

    pub fn config(&self) -> &BehaviorConfig {
        &self.config
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn state(&self) -> BehaviorState {
        self.decision.state
    }

    pub fn decision(&self) -> &BehaviorDecision {
        &self.decision
    }

    /// When the current state was entered.
    pub fn state_entered_at(&self) -> f64 {
        self.state_entered_at
    }

    pub fn maneuver(&self) -> Option<&Maneuver> {
        self.maneuver.as_ref()
    }

    /// Most recent transitions, oldest first.
    pub fn transitions(&self) -> &VecDeque<Transition> {
        &self.transitions
    }

    pub fn last_assessment(&self) -> Option<&Assessment> {
        self.last_assessment.as_ref()
    }

    /// Back to IDLE with no maneuver and an empty log.
    pub fn reset(&mut self) {
        self.decision = BehaviorDecision::initial();
        self.state_entered_at = 0.0;
        self.maneuver = None;
        self.transitions.clear();
        self.last_assessment = None;
    }

    /// Decide this tick's behavior.
    pub fn plan(&mut self, ctx: &BehaviorContext<'_>) -> BehaviorDecision {
        let now = ctx.timestamp;
        let assessment = assess(&self.config, ctx);

        // A lane change that ran its course has put the ego in the next lane
        if let Some(maneuver) = self.maneuver {
            if now - maneuver.started_at >= self.config.lane_change_timeout {
                self.decision.lane_index += maneuver.side.sign();
                self.maneuver = None;
                info!(
                    state = %maneuver.state,
                    lane_index = self.decision.lane_index,
                    "lane change complete"
                );
            }
        }

        let input = RuleInput {
            config: &self.config,
            assessment: &assessment,
            context: ctx,
            maneuver: self.maneuver.as_ref(),
        };
        let fired = self
            .rules
            .iter()
            .enumerate()
            .find(|(_, rule)| (rule.guard)(&input))
            .map(|(rank, rule)| (rank, rule.name, (rule.action)(&input)));
        let (rank, rule_name, selection) =
            fired.unwrap_or_else(|| (self.rules.len(), "fallback", lane_keep_action(&input)));
        let priority = u8::try_from(self.rules.len().saturating_sub(rank)).unwrap_or(u8::MAX);

        debug!(
            rule = rule_name,
            state = %selection.state,
            target_speed = selection.target_speed,
            ttc = ?assessment.time_to_collision,
            lead_gap = ?assessment.lead.map(|l| l.gap),
            lane_error = assessment.lane_error,
            "behavior rule fired"
        );

        self.track_maneuver(&selection, now);
        self.apply(selection, priority, now);
        self.last_assessment = Some(assessment);
        self.decision.clone()
    }

    fn track_maneuver(&mut self, selection: &Selection, now: f64) {
        match selection.side {
            Some(side) if selection.state.is_lane_change() => {
                let continuing = self
                    .maneuver
                    .is_some_and(|m| m.state == selection.state && m.side == side);
                if !continuing {
                    self.maneuver = Some(Maneuver {
                        state: selection.state,
                        side,
                        started_at: now,
                    });
                }
            }
            _ => self.maneuver = None,
        }
    }

    fn apply(&mut self, selection: Selection, priority: u8, now: f64) {
        let previous = self.decision.state;
        if selection.state != previous {
            info!(
                from = %previous,
                to = %selection.state,
                reason = %selection.reason,
                "behavior transition"
            );
            if self.transitions.len() >= self.config.transition_log_len {
                self.transitions.pop_front();
            }
            self.transitions.push_back(Transition {
                from: previous,
                to: selection.state,
                timestamp: now,
                reason: selection.reason.clone(),
            });
            self.state_entered_at = now;
        }

        self.decision.state = selection.state;
        self.decision.target_speed = selection.target_speed.max(0.0);
        self.decision.target_lane_offset = selection.target_lane_offset;
        self.decision.reason = selection.reason;
        self.decision.priority = priority;
        self.decision.timestamp = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Junction, LaneInfo, TrafficLight};
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn object(id: u64, class: ObjectClass, x: f64, y: f64, vx: f64) -> TrackedObject {
        TrackedObject {
            id: TrackId(id),
            class,
            position: Vector3::new(x, y, 0.0),
            velocity: Vector3::new(vx, 0.0, 0.0),
            acceleration: Vector3::zeros(),
            speed: vx.abs(),
            heading: 0.0,
            distance: x.hypot(y),
            confidence: 0.9,
            age: 0.0,
            consecutive_hits: 5,
            consecutive_misses: 0,
            last_update: 0.0,
        }
    }

    fn two_lane_map() -> MapContext {
        MapContext {
            lane: LaneInfo {
                left_available: true,
                ..LaneInfo::default()
            },
            ..MapContext::default()
        }
    }

    fn decide(
        arbiter: &mut BehaviorArbiter,
        speed: f64,
        objects: &[TrackedObject],
        map: &MapContext,
        t: f64,
    ) -> BehaviorDecision {
        let ego = VehicleState::planar(0.0, 0.0, 0.0, speed, t);
        arbiter.plan(&BehaviorContext {
            ego: &ego,
            objects,
            map,
            mission: Mission::Cruise,
            lane_offset: 0.0,
            timestamp: t,
        })
    }

    #[test]
    fn test_starts_idle_then_keeps_lane() {
        let mut arbiter = BehaviorArbiter::with_defaults();
        assert_eq!(arbiter.state(), BehaviorState::Idle);

        let decision = decide(&mut arbiter, 10.0, &[], &MapContext::default(), 0.1);

        assert_eq!(decision.state, BehaviorState::LaneKeep);
        assert_relative_eq!(decision.target_speed, 13.9);
        assert_eq!(arbiter.transitions().len(), 1);
    }

    #[test]
    fn test_adaptive_cruise_keeps_headway() {
        let mut arbiter = BehaviorArbiter::with_defaults();
        // Lead 29 m ahead: gap = 29 - 2 (footprint) - 2 (front) = 25 m
        let lead = object(1, ObjectClass::Vehicle, 29.0, 0.0, 10.0);
        let decision = decide(&mut arbiter, 10.0, &[lead], &MapContext::default(), 0.1);

        assert_eq!(decision.state, BehaviorState::LaneKeep);
        assert_relative_eq!(decision.target_speed, (25.0 - 5.0) / 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_speed_limit_caps_cruise() {
        let mut arbiter = BehaviorArbiter::with_defaults();
        let map = MapContext {
            lane: LaneInfo {
                speed_limit: Some(8.0),
                ..LaneInfo::default()
            },
            ..MapContext::default()
        };
        let decision = decide(&mut arbiter, 10.0, &[], &map, 0.1);
        assert_relative_eq!(decision.target_speed, 8.0);
    }

    #[test]
    fn test_low_ttc_overrides_everything() {
        let mut arbiter = BehaviorArbiter::with_defaults();
        let map = MapContext {
            traffic_lights: vec![TrafficLight { x: 30.0, y: 0.0, state: LightState::Red }],
            junctions: vec![Junction { x: 20.0, y: 0.0, radius: 5.0 }],
            ..two_lane_map()
        };
        // Stopped car, gap 20 - 4 = 16 m, closing at 10 m/s → TTC 1.6 s
        let lead = object(1, ObjectClass::Vehicle, 20.0, 0.0, 0.0);
        let decision = decide(&mut arbiter, 10.0, &[lead], &map, 0.1);

        assert_eq!(decision.state, BehaviorState::Emergency);
        assert_eq!(decision.target_speed, 0.0);
        assert_eq!(decision.priority, 8);
        let ttc = arbiter.last_assessment().unwrap().time_to_collision.unwrap();
        assert_relative_eq!(ttc, 1.6, epsilon = 1e-9);
    }

    #[test]
    fn test_pedestrian_in_corridor_is_emergency() {
        let mut arbiter = BehaviorArbiter::with_defaults();
        let walker = object(2, ObjectClass::Pedestrian, 12.0, 1.0, 0.0);
        let decision = decide(&mut arbiter, 5.0, &[walker], &MapContext::default(), 0.1);
        assert_eq!(decision.state, BehaviorState::Emergency);

        // Same pedestrian on the far sidewalk is ignored
        let mut arbiter = BehaviorArbiter::with_defaults();
        let walker = object(2, ObjectClass::Pedestrian, 12.0, 6.0, 0.0);
        let decision = decide(&mut arbiter, 5.0, &[walker], &MapContext::default(), 0.1);
        assert_eq!(decision.state, BehaviorState::LaneKeep);
    }

    #[test]
    fn test_red_light_stops_and_green_releases() {
        let mut arbiter = BehaviorArbiter::with_defaults();
        let mut map = MapContext {
            traffic_lights: vec![TrafficLight { x: 40.0, y: 4.0, state: LightState::Red }],
            ..MapContext::default()
        };
        let decision = decide(&mut arbiter, 10.0, &[], &map, 0.1);
        assert_eq!(decision.state, BehaviorState::Stop);
        assert_eq!(decision.target_speed, 0.0);

        map.traffic_lights[0].state = LightState::Green;
        let decision = decide(&mut arbiter, 0.0, &[], &map, 0.2);
        assert_eq!(decision.state, BehaviorState::LaneKeep);

        // Out of range lights do not count
        map.traffic_lights[0] = TrafficLight { x: 80.0, y: 0.0, state: LightState::Red };
        let decision = decide(&mut arbiter, 10.0, &[], &map, 0.3);
        assert_eq!(decision.state, BehaviorState::LaneKeep);
    }

    #[test]
    fn test_lane_change_requires_gap() {
        let map = two_lane_map();
        // Slow lead at 30 m: 7 m/s < 0.8 × 13.9 but above the overtake ratio
        let lead = object(1, ObjectClass::Vehicle, 34.0, 0.0, 7.0);
        let blocker = object(2, ObjectClass::Vehicle, 8.0, 3.5, 10.0);

        let mut arbiter = BehaviorArbiter::with_defaults();
        let decision = decide(&mut arbiter, 10.0, &[lead.clone(), blocker], &map, 0.1);
        assert_eq!(decision.state, BehaviorState::LaneKeep);
        assert!(!arbiter.last_assessment().unwrap().left_safe);

        let mut arbiter = BehaviorArbiter::with_defaults();
        let decision = decide(&mut arbiter, 10.0, &[lead], &map, 0.1);
        assert_eq!(decision.state, BehaviorState::LaneChangeLeft);
        assert_relative_eq!(decision.target_lane_offset, 3.5);
    }

    #[test]
    fn test_lane_change_requires_low_speed() {
        let mut arbiter = BehaviorArbiter::with_defaults();
        let lead = object(1, ObjectClass::Vehicle, 34.0, 0.0, 7.0);
        let decision = decide(&mut arbiter, 21.0, &[lead], &two_lane_map(), 0.1);
        assert!(!decision.state.is_lane_change());
    }

    #[test]
    fn test_very_slow_lead_triggers_overtake() {
        let mut arbiter = BehaviorArbiter::with_defaults();
        let lead = object(1, ObjectClass::Vehicle, 44.0, 0.0, 2.0);
        let decision = decide(&mut arbiter, 10.0, &[lead], &two_lane_map(), 0.1);

        assert_eq!(decision.state, BehaviorState::Overtake);
        assert!(decision.target_speed <= arbiter.config().max_lane_change_speed);
    }

    #[test]
    fn test_right_lane_change_when_left_unavailable() {
        let mut arbiter = BehaviorArbiter::with_defaults();
        let map = MapContext {
            lane: LaneInfo {
                right_available: true,
                ..LaneInfo::default()
            },
            ..MapContext::default()
        };
        let lead = object(1, ObjectClass::Vehicle, 34.0, 0.0, 2.0);
        let decision = decide(&mut arbiter, 10.0, &[lead], &map, 0.1);

        assert_eq!(decision.state, BehaviorState::LaneChangeRight);
        assert_relative_eq!(decision.target_lane_offset, -3.5);
    }

    #[test]
    fn test_lane_change_completes_after_timeout() {
        let mut arbiter = BehaviorArbiter::with_defaults();
        let map = two_lane_map();
        let lead = object(1, ObjectClass::Vehicle, 34.0, 0.0, 7.0);
        assert_eq!(
            decide(&mut arbiter, 10.0, &[lead], &map, 0.0).state,
            BehaviorState::LaneChangeLeft
        );

        // Lead gone from view; the maneuver still runs its course
        for i in 1..50 {
            let decision = decide(&mut arbiter, 10.0, &[], &map, i as f64 * 0.1);
            assert_eq!(decision.state, BehaviorState::LaneChangeLeft, "tick {i}");
            assert_eq!(decision.lane_index, 0);
        }

        let decision = decide(&mut arbiter, 10.0, &[], &map, 5.0);
        assert_eq!(decision.state, BehaviorState::LaneKeep);
        assert_eq!(decision.lane_index, 1);
        assert_eq!(decision.target_lane_offset, 0.0);
        assert!(arbiter.maneuver().is_none());
    }

    #[test]
    fn test_lane_change_aborts_when_target_closes() {
        let mut arbiter = BehaviorArbiter::with_defaults();
        let map = two_lane_map();
        let lead = object(1, ObjectClass::Vehicle, 34.0, 0.0, 7.0);
        decide(&mut arbiter, 10.0, &[lead.clone()], &map, 0.0);

        let intruder = object(2, ObjectClass::Vehicle, 3.0, 3.5, 12.0);
        let decision = decide(&mut arbiter, 10.0, &[lead, intruder], &map, 0.5);

        assert_eq!(decision.state, BehaviorState::LaneKeep);
        assert!(decision.reason.contains("aborted"));
        assert_eq!(decision.lane_index, 0);
    }

    #[test]
    fn test_lane_change_aborts_late_in_the_maneuver() {
        let mut arbiter = BehaviorArbiter::with_defaults();
        let map = two_lane_map();
        let lead = object(1, ObjectClass::Vehicle, 34.0, 0.0, 7.0);
        decide(&mut arbiter, 10.0, &[lead], &map, 0.0);
        for i in 1..25 {
            let decision = decide(&mut arbiter, 10.0, &[], &map, i as f64 * 0.1);
            assert_eq!(decision.state, BehaviorState::LaneChangeLeft);
        }

        let intruder = object(2, ObjectClass::Vehicle, 3.0, 3.5, 12.0);
        let decision = decide(&mut arbiter, 10.0, &[intruder], &map, 2.5);
        let assessment = arbiter.last_assessment().unwrap();

        assert!(!assessment.side_clear(Side::Left, arbiter.config()));
        assert_eq!(decision.state, BehaviorState::LaneKeep);
        assert_eq!(decision.target_lane_offset, 0.0);
        assert_eq!(decision.lane_index, 0);
        assert!(arbiter.maneuver().is_none());
    }

    #[test]
    fn test_lane_change_aborts_when_ego_too_fast() {
        let mut arbiter = BehaviorArbiter::with_defaults();
        let map = two_lane_map();
        let lead = object(1, ObjectClass::Vehicle, 34.0, 0.0, 7.0);
        decide(&mut arbiter, 10.0, &[lead], &map, 0.0);

        let too_fast = arbiter.config().max_lane_change_speed + 1.0;
        let decision = decide(&mut arbiter, too_fast, &[], &map, 3.0);
        assert!(!decision.state.is_lane_change());
    }

    #[test]
    fn test_merge_when_lane_ends() {
        let mut arbiter = BehaviorArbiter::with_defaults();
        let map = MapContext {
            lane: LaneInfo {
                left_available: true,
                ends_in: Some(40.0),
                ..LaneInfo::default()
            },
            ..MapContext::default()
        };
        let decision = decide(&mut arbiter, 10.0, &[], &map, 0.1);

        assert_eq!(decision.state, BehaviorState::Merge);
        assert!(decision.target_lane_offset > 0.0);
    }

    #[test]
    fn test_intersection_caps_speed() {
        let mut arbiter = BehaviorArbiter::with_defaults();
        let map = MapContext {
            junctions: vec![Junction { x: 25.0, y: 0.0, radius: 8.0 }],
            ..MapContext::default()
        };
        let decision = decide(&mut arbiter, 10.0, &[], &map, 0.1);

        assert_eq!(decision.state, BehaviorState::Intersection);
        assert_relative_eq!(decision.target_speed, 6.0);
    }

    #[test]
    fn test_missions_select_states() {
        let map = MapContext::default();
        let ego = VehicleState::planar(0.0, 0.0, 0.0, 5.0, 0.1);
        let expected = [
            (Mission::PullOver, BehaviorState::PullOver),
            (Mission::Park, BehaviorState::Parking),
            (Mission::Idle, BehaviorState::Idle),
        ];
        for (mission, state) in expected {
            let mut arbiter = BehaviorArbiter::with_defaults();
            let decision = arbiter.plan(&BehaviorContext {
                ego: &ego,
                objects: &[],
                map: &map,
                mission,
                lane_offset: 0.0,
                timestamp: 0.1,
            });
            assert_eq!(decision.state, state);
        }
    }

    #[test]
    fn test_rule_order_is_fixed() {
        let names: Vec<&str> = default_rules().iter().map(|r| r.name).collect();
        assert_eq!(
            names,
            [
                "emergency",
                "traffic_light",
                "lane_change_in_progress",
                "intersection",
                "mission",
                "merge",
                "lane_change",
                "lane_keep"
            ]
        );
    }

    #[test]
    fn test_transition_log_is_bounded() {
        let config = BehaviorConfig {
            transition_log_len: 3,
            ..BehaviorConfig::default()
        };
        let mut arbiter = BehaviorArbiter::new(config).unwrap();
        let red = MapContext {
            traffic_lights: vec![TrafficLight { x: 30.0, y: 0.0, state: LightState::Red }],
            ..MapContext::default()
        };
        let green = MapContext::default();
        for i in 0..10 {
            let map = if i % 2 == 0 { &red } else { &green };
            decide(&mut arbiter, 5.0, &[], map, i as f64);
        }

        assert_eq!(arbiter.transitions().len(), 3);
        assert_eq!(arbiter.transitions().back().unwrap().timestamp, 9.0);
        assert_eq!(arbiter.state_entered_at(), 9.0);
    }

    #[test]
    fn test_reset_returns_to_idle() {
        let mut arbiter = BehaviorArbiter::with_defaults();
        decide(&mut arbiter, 10.0, &[], &MapContext::default(), 0.1);
        arbiter.reset();

        assert_eq!(arbiter.state(), BehaviorState::Idle);
        assert!(arbiter.transitions().is_empty());
        assert_eq!(arbiter.decision().lane_index, 0);
    }

    #[test]
    fn test_config_validation() {
        assert!(BehaviorConfig::default().validate().is_ok());
        let bad = BehaviorConfig {
            lane_change_timeout: 0.0,
            ..BehaviorConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = BehaviorConfig {
            overtake_speed_ratio: 0.9,
            ..BehaviorConfig::default()
        };
        assert!(BehaviorArbiter::new(bad).is_err());
    }
}
