//! Ground truth oracle for simulation.
//!
//! The Oracle maintains the "God's eye view" of the simulated road:
//! - True state of the ego vehicle (kinematic bicycle model)
//! - Scripted actors (vehicles, pedestrians, static obstacles)
//! - Traffic light phases and the lane layout
//! - Sensor batch generation (per-channel noise and dropouts)
//!
//! The road is straight along +x. Lane `k` is centred at `y = k * lane_width`,
//! so lane 0 is the rightmost lane and higher indices lie to the left.

use nalgebra::{Vector2, Vector3};
use pilot_core::types::{
    ControlCommand, DetectedObject, Junction, LaneInfo, LightState, MapContext, ObjectClass, SensorBatch,
    SensorKind, TrafficLight, VehicleState,
};
use pilot_core::validation::GroundTruth;
use pilot_core::VehicleConfig;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Ego footprint (length, width) in meters.
pub const EGO_DIMENSIONS: (f64, f64) = (4.5, 1.8);

/// Box footprint (length, width) of an actor class.
pub fn class_dimensions(class: ObjectClass) -> (f64, f64) {
    match class {
        ObjectClass::Vehicle => (4.5, 1.8),
        ObjectClass::Pedestrian => (0.5, 0.5),
        ObjectClass::Cyclist => (1.8, 0.6),
        ObjectClass::Static | ObjectClass::Unknown => (1.5, 1.5),
    }
}

/// Separation between two road-aligned boxes. Negative when they overlap.
pub fn box_clearance(a: Vector2<f64>, a_dims: (f64, f64), b: Vector2<f64>, b_dims: (f64, f64)) -> f64 {
    let dx = (a.x - b.x).abs() - 0.5 * (a_dims.0 + b_dims.0);
    let dy = (a.y - b.y).abs() - 0.5 * (a_dims.1 + b_dims.1);
    dx.max(dy)
}

// ============================================================================
// ROAD
// ============================================================================

/// Straight multi-lane road.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Road {
    pub lanes: usize,
    pub lane_width: f64,
    pub speed_limit: Option<f64>,
}

impl Default for Road {
    fn default() -> Self {
        Self {
            lanes: 1,
            lane_width: 3.5,
            speed_limit: None,
        }
    }
}

impl Road {
    /// Lane whose centre is nearest to lateral position `y`.
    pub fn lane_of(&self, y: f64) -> usize {
        let max = self.lanes.saturating_sub(1) as f64;
        (y / self.lane_width).round().clamp(0.0, max) as usize
    }

    pub fn lane_center(&self, lane: usize) -> f64 {
        lane as f64 * self.lane_width
    }
}

// ============================================================================
// ACTORS
// ============================================================================

/// How an actor moves over time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorScript {
    /// Constant speed along the heading
    Cruise,
    /// Constant speed until `time`, then decelerate at `decel` to a stop
    BrakeAt { time: f64, decel: f64 },
    /// Stand still until `time`, then move at `speed`
    StartAt { time: f64, speed: f64 },
}

/// A ground truth road user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub id: u32,
    pub class: ObjectClass,
    pub position: Vector2<f64>,
    pub heading: f64,
    pub speed: f64,
    pub script: ActorScript,
}

impl Actor {
    pub fn velocity(&self) -> Vector2<f64> {
        Vector2::new(self.heading.cos(), self.heading.sin()) * self.speed
    }

    pub fn dimensions(&self) -> (f64, f64) {
        class_dimensions(self.class)
    }

    fn step(&mut self, time: f64, dt: f64) {
        match self.script {
            ActorScript::Cruise => {}
            ActorScript::BrakeAt { time: at, decel } => {
                if time >= at {
                    self.speed = (self.speed - decel * dt).max(0.0);
                }
            }
            ActorScript::StartAt { time: at, speed } => {
                self.speed = if time >= at { speed } else { 0.0 };
            }
        }
        self.position += self.velocity() * dt;
    }
}

/// A traffic light that shows red until `red_until`, then green.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LightScript {
    pub x: f64,
    pub y: f64,
    pub red_until: f64,
}

impl LightScript {
    pub fn state_at(&self, time: f64) -> LightState {
        if time < self.red_until {
            LightState::Red
        } else {
            LightState::Green
        }
    }
}

// ============================================================================
// SENSORS
// ============================================================================

/// Noise model of one sensor channel. Sensors see all around the ego out
/// to `range`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorModel {
    pub channel: String,
    pub kind: SensorKind,
    pub range: f64,
    /// Position noise standard deviation per axis (m)
    pub position_std: f64,
    /// Present only for channels that measure velocity
    pub velocity_std: Option<f64>,
    /// Probability that an object is missed in a cycle
    pub dropout: f64,
    pub confidence: f64,
}

impl SensorModel {
    pub fn lidar() -> Self {
        Self {
            channel: "front_lidar".to_string(),
            kind: SensorKind::Lidar,
            range: 80.0,
            position_std: 0.15,
            velocity_std: None,
            dropout: 0.02,
            confidence: 0.9,
        }
    }

    pub fn radar() -> Self {
        Self {
            channel: "front_radar".to_string(),
            kind: SensorKind::Radar,
            range: 120.0,
            position_std: 0.5,
            velocity_std: Some(0.2),
            dropout: 0.05,
            confidence: 0.8,
        }
    }

    pub fn camera() -> Self {
        Self {
            channel: "front_camera".to_string(),
            kind: SensorKind::Camera,
            range: 60.0,
            position_std: 0.4,
            velocity_std: None,
            dropout: 0.1,
            confidence: 0.7,
        }
    }

    /// Lidar, radar and camera.
    pub fn default_suite() -> Vec<Self> {
        vec![Self::lidar(), Self::radar(), Self::camera()]
    }
}

// ============================================================================
// EGO
// ============================================================================

/// True ego state, integrated with a kinematic bicycle model.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EgoVehicle {
    pub x: f64,
    pub y: f64,
    pub yaw: f64,
    pub speed: f64,
    pub steering: f64,
    pub acceleration: f64,
}

impl EgoVehicle {
    pub fn new(x: f64, y: f64, yaw: f64, speed: f64) -> Self {
        Self {
            x,
            y,
            yaw,
            speed,
            ..Self::default()
        }
    }

    pub fn position(&self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }
}

// ============================================================================
// ORACLE
// ============================================================================

/// The Oracle - maintains ground truth and generates sensor batches.
pub struct Oracle {
    /// Seed of the physics stream (separate from the stack's own seeds)
    physics_seed: u64,

    /// RNG for sensor noise and dropouts
    physics_rng: ChaCha8Rng,

    vehicle: VehicleConfig,
    road: Road,
    ego: EgoVehicle,
    actors: Vec<Actor>,
    lights: Vec<LightScript>,
    junctions: Vec<Junction>,
    sensors: Vec<SensorModel>,

    /// Next actor ID
    next_id: u32,

    /// Current simulation time (seconds)
    current_time: f64,
}

impl Oracle {
    /// Creates a new Oracle with the default sensor suite.
    pub fn new(physics_seed: u64, vehicle: VehicleConfig, road: Road, ego: EgoVehicle) -> Self {
        Self {
            physics_seed,
            physics_rng: ChaCha8Rng::seed_from_u64(physics_seed),
            vehicle,
            road,
            ego,
            actors: Vec::new(),
            lights: Vec::new(),
            junctions: Vec::new(),
            sensors: SensorModel::default_suite(),
            next_id: 1,
            current_time: 0.0,
        }
    }

    pub fn physics_seed(&self) -> u64 {
        self.physics_seed
    }

    pub fn set_sensors(&mut self, sensors: Vec<SensorModel>) {
        self.sensors = sensors;
    }

    /// Spawns a scripted actor and returns its ID.
    pub fn spawn_actor(
        &mut self,
        class: ObjectClass,
        position: Vector2<f64>,
        heading: f64,
        speed: f64,
        script: ActorScript,
    ) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        let speed = match script {
            ActorScript::StartAt { .. } => 0.0,
            _ => speed,
        };
        self.actors.push(Actor {
            id,
            class,
            position,
            heading,
            speed,
            script,
        });
        id
    }

    pub fn add_light(&mut self, light: LightScript) {
        self.lights.push(light);
    }

    pub fn add_junction(&mut self, junction: Junction) {
        self.junctions.push(junction);
    }

    /// Latch a control command; it acts during the following steps.
    pub fn apply_control(&mut self, command: &ControlCommand) {
        let limit = self.vehicle.max_steering_angle;
        self.ego.steering = if command.steering.is_finite() {
            command.steering.clamp(-limit, limit)
        } else {
            0.0
        };
        let throttle = command.throttle.clamp(0.0, 1.0);
        let brake = command.brake.clamp(0.0, 1.0);
        self.ego.acceleration = throttle * self.vehicle.max_acceleration - brake * self.vehicle.max_deceleration;
    }

    /// Advances physics by dt seconds.
    pub fn step(&mut self, dt: f64) {
        let ego = &mut self.ego;
        ego.x += ego.speed * ego.yaw.cos() * dt;
        ego.y += ego.speed * ego.yaw.sin() * dt;
        ego.yaw += ego.speed / self.vehicle.wheelbase * ego.steering.tan() * dt;
        ego.speed = (ego.speed + ego.acceleration * dt).clamp(0.0, self.vehicle.max_speed);

        for actor in &mut self.actors {
            actor.step(self.current_time, dt);
        }
        self.current_time += dt;
    }

    /// Returns the current simulation time.
    pub fn time(&self) -> f64 {
        self.current_time
    }

    pub fn road(&self) -> &Road {
        &self.road
    }

    pub fn ego(&self) -> &EgoVehicle {
        &self.ego
    }

    pub fn actors(&self) -> &[Actor] {
        &self.actors
    }

    pub fn actor(&self, id: u32) -> Option<&Actor> {
        self.actors.iter().find(|a| a.id == id)
    }

    pub fn lights(&self) -> &[LightScript] {
        &self.lights
    }

    /// Ego state as localization would report it.
    pub fn ego_state(&self) -> VehicleState {
        let ego = &self.ego;
        let mut state = VehicleState::planar(ego.x, ego.y, ego.yaw, ego.speed, self.current_time);
        state.steering_angle = ego.steering;
        state.acceleration = Vector3::new(ego.acceleration * ego.yaw.cos(), ego.acceleration * ego.yaw.sin(), 0.0);
        state.angular_velocity.z = ego.speed / self.vehicle.wheelbase * ego.steering.tan();
        state
    }

    pub fn ego_lane(&self) -> usize {
        self.road.lane_of(self.ego.y)
    }

    /// Ego offset from the centre of the lane it occupies (left positive).
    pub fn lane_offset(&self) -> f64 {
        self.ego.y - self.road.lane_center(self.ego_lane())
    }

    /// Map snapshot around the ego.
    pub fn map_context(&self) -> MapContext {
        let lane = self.ego_lane();
        MapContext {
            lane: LaneInfo {
                width: self.road.lane_width,
                left_available: lane + 1 < self.road.lanes,
                right_available: lane > 0,
                speed_limit: self.road.speed_limit,
                ends_in: None,
            },
            traffic_lights: self
                .lights
                .iter()
                .map(|l| TrafficLight {
                    x: l.x,
                    y: l.y,
                    state: l.state_at(self.current_time),
                })
                .collect(),
            junctions: self.junctions.clone(),
        }
    }

    fn sensing_range(&self) -> f64 {
        self.sensors.iter().map(|s| s.range).fold(0.0, f64::max)
    }

    /// One batch per sensor channel, detections in the world frame.
    pub fn sense(&mut self) -> Vec<SensorBatch> {
        let ego = self.ego.position();
        let mut batches = Vec::with_capacity(self.sensors.len());

        for sensor in &self.sensors {
            let mut detections = Vec::new();
            for actor in &self.actors {
                if (actor.position - ego).norm() > sensor.range {
                    continue;
                }
                if self.physics_rng.gen::<f64>() < sensor.dropout {
                    continue;
                }
                let nx: f64 = self.physics_rng.sample(StandardNormal);
                let ny: f64 = self.physics_rng.sample(StandardNormal);
                let mut detection = DetectedObject::new(
                    actor.position.x + nx * sensor.position_std,
                    actor.position.y + ny * sensor.position_std,
                    actor.class,
                    sensor.confidence,
                );
                if let Some(std) = sensor.velocity_std {
                    let vx: f64 = self.physics_rng.sample(StandardNormal);
                    let vy: f64 = self.physics_rng.sample(StandardNormal);
                    let v = actor.velocity();
                    detection = detection.with_velocity(v.x + vx * std, v.y + vy * std);
                }
                detections.push(detection);
            }
            batches.push(SensorBatch::new(sensor.channel.clone(), sensor.kind, detections));
        }
        batches
    }

    /// Actors within sensing range, for scoring the tracker.
    pub fn ground_truth(&self) -> Vec<GroundTruth> {
        let ego = self.ego.position();
        let range = self.sensing_range();
        self.actors
            .iter()
            .filter(|a| (a.position - ego).norm() <= range)
            .map(|a| {
                let v = a.velocity();
                GroundTruth {
                    actor_id: a.id,
                    position: Vector3::new(a.position.x, a.position.y, 0.0),
                    velocity: Vector3::new(v.x, v.y, 0.0),
                }
            })
            .collect()
    }

    /// Box clearance between the ego and one actor.
    pub fn clearance_to(&self, actor: &Actor) -> f64 {
        box_clearance(self.ego.position(), EGO_DIMENSIONS, actor.position, actor.dimensions())
    }

    /// Smallest ego clearance over all actors, with the actor's ID.
    pub fn min_clearance(&self) -> Option<(u32, f64)> {
        self.actors
            .iter()
            .map(|a| (a.id, self.clearance_to(a)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use pilot_core::types::Gear;

    fn oracle(seed: u64) -> Oracle {
        Oracle::new(seed, VehicleConfig::default(), Road::default(), EgoVehicle::new(0.0, 0.0, 0.0, 10.0))
    }

    fn command(steering: f64, throttle: f64, brake: f64) -> ControlCommand {
        ControlCommand {
            steering,
            throttle,
            brake,
            gear: Gear::Drive,
            timestamp: 0.0,
            error: Default::default(),
        }
    }

    #[test]
    fn test_oracle_spawn_actor() {
        let mut oracle = oracle(42);
        let id = oracle.spawn_actor(
            ObjectClass::Vehicle,
            Vector2::new(100.0, 0.0),
            0.0,
            10.0,
            ActorScript::Cruise,
        );

        let actor = oracle.actor(id).unwrap();
        assert_eq!(actor.position.x, 100.0);
        assert_eq!(actor.class, ObjectClass::Vehicle);
        assert_eq!(id, 1);
    }

    #[test]
    fn test_oracle_physics_step() {
        let mut oracle = oracle(42);
        let id = oracle.spawn_actor(ObjectClass::Vehicle, Vector2::zeros(), 0.0, 20.0, ActorScript::Cruise);

        for _ in 0..10 {
            oracle.step(0.1);
        }

        assert_relative_eq!(oracle.actor(id).unwrap().position.x, 20.0, epsilon = 1e-9);
        // Ego coasts with no command latched
        assert_relative_eq!(oracle.ego().x, 10.0, epsilon = 1e-9);
        assert_relative_eq!(oracle.time(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_scripts() {
        let mut oracle = oracle(1);
        let braking = oracle.spawn_actor(
            ObjectClass::Vehicle,
            Vector2::zeros(),
            0.0,
            10.0,
            ActorScript::BrakeAt { time: 1.0, decel: 5.0 },
        );
        let walker = oracle.spawn_actor(
            ObjectClass::Pedestrian,
            Vector2::new(0.0, -4.0),
            std::f64::consts::FRAC_PI_2,
            1.4,
            ActorScript::StartAt { time: 1.0, speed: 1.4 },
        );
        for _ in 0..40 {
            oracle.step(0.1);
        }

        let braking = oracle.actor(braking).unwrap();
        assert_eq!(braking.speed, 0.0);
        assert_relative_eq!(braking.position.x, 20.0, epsilon = 0.6);

        let walker = oracle.actor(walker).unwrap();
        assert_relative_eq!(walker.position.y, -4.0 + 1.4 * 3.0, epsilon = 0.3);
    }

    #[test]
    fn test_ego_bicycle_model() {
        let mut oracle = oracle(1);
        oracle.apply_control(&command(0.2, 0.0, 0.0));
        oracle.step(0.1);
        oracle.step(0.1);
        assert!(oracle.ego().yaw > 0.0, "positive steering turns left");
        assert!(oracle.ego().y > 0.0);

        oracle.apply_control(&command(0.0, 0.0, 1.0));
        for _ in 0..30 {
            oracle.step(0.1);
        }
        assert_eq!(oracle.ego().speed, 0.0);
    }

    #[test]
    fn test_oracle_deterministic_noise() {
        let mut a = oracle(42);
        let mut b = oracle(42);
        for o in [&mut a, &mut b] {
            o.spawn_actor(ObjectClass::Vehicle, Vector2::new(20.0, 0.0), 0.0, 5.0, ActorScript::Cruise);
        }

        // Same seed = same noise
        assert_eq!(a.sense(), b.sense());
    }

    #[test]
    fn test_sense_one_batch_per_channel() {
        let mut oracle = oracle(3);
        oracle.spawn_actor(ObjectClass::Vehicle, Vector2::new(20.0, 0.0), 0.0, 5.0, ActorScript::Cruise);
        oracle.spawn_actor(ObjectClass::Vehicle, Vector2::new(500.0, 0.0), 0.0, 5.0, ActorScript::Cruise);
        oracle.set_sensors(vec![SensorModel {
            dropout: 0.0,
            ..SensorModel::radar()
        }]);

        let batches = oracle.sense();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].detections.len(), 1, "far actor is out of range");
        let detection = &batches[0].detections[0];
        assert!(detection.velocity.is_some());
        assert!((detection.position.x - 20.0).abs() < 3.0);
        assert_eq!(oracle.ground_truth().len(), 1);
    }

    #[test]
    fn test_map_context_lanes() {
        let road = Road {
            lanes: 2,
            lane_width: 4.0,
            speed_limit: Some(8.0),
        };
        let oracle = Oracle::new(0, VehicleConfig::default(), road, EgoVehicle::new(0.0, 0.5, 0.0, 0.0));
        let map = oracle.map_context();

        assert!(map.lane.left_available);
        assert!(!map.lane.right_available);
        assert_eq!(map.lane.speed_limit, Some(8.0));
        assert_relative_eq!(oracle.lane_offset(), 0.5, epsilon = 1e-12);

        let road = oracle.road();
        assert_eq!(road.lane_of(3.0), 1);
        assert_eq!(road.lane_of(-7.0), 0);
        assert_eq!(road.lane_of(99.0), 1);
    }

    #[test]
    fn test_light_phases() {
        let light = LightScript {
            x: 50.0,
            y: 0.0,
            red_until: 5.0,
        };
        assert_eq!(light.state_at(4.9), LightState::Red);
        assert_eq!(light.state_at(5.0), LightState::Green);
    }

    #[test]
    fn test_box_clearance() {
        let dims = (4.5, 1.8);
        let c = box_clearance(Vector2::zeros(), dims, Vector2::new(10.0, 0.0), dims);
        assert_relative_eq!(c, 5.5, epsilon = 1e-12);

        // Side by side in adjacent lanes
        let c = box_clearance(Vector2::zeros(), dims, Vector2::new(0.0, 4.0), dims);
        assert_relative_eq!(c, 2.2, epsilon = 1e-12);

        assert!(box_clearance(Vector2::zeros(), dims, Vector2::new(2.0, 0.5), dims) < 0.0);
    }
}
