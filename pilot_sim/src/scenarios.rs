//! Closed-loop driving scenarios.
//!
//! Each scenario is a road, an ego start, scripted actors and a sensor
//! suite. Pass criteria live in the runner.

use nalgebra::Vector2;
use pilot_core::types::{Junction, ObjectClass};
use pilot_core::{Mission, VehicleConfig};
use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_PI_2;

use crate::error::SimError;
use crate::oracle::{ActorScript, EgoVehicle, LightScript, Oracle, Road, SensorModel};

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// Empty road, ego starts off-centre and must settle on the lane
    StraightCruise,

    /// Slower lead vehicle, ego must settle into adaptive cruise
    FollowLead,

    /// Lead vehicle brakes hard, ego must stop without contact
    LeadBrake,

    /// Pedestrian walks across the lane ahead
    PedestrianCrossing,

    /// Red light ahead that turns green later
    RedLight,

    /// Two-lane road with a crawling lead, ego should overtake on the left
    SlowLead,

    /// Two-lane road with a static obstacle in the ego lane
    ObstacleDetour,

    /// Three vehicles seen by three noisy channels with dropouts
    SensorFusion,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::StraightCruise,
            ScenarioId::FollowLead,
            ScenarioId::LeadBrake,
            ScenarioId::PedestrianCrossing,
            ScenarioId::RedLight,
            ScenarioId::SlowLead,
            ScenarioId::ObstacleDetour,
            ScenarioId::SensorFusion,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::StraightCruise => "straight_cruise",
            ScenarioId::FollowLead => "follow_lead",
            ScenarioId::LeadBrake => "lead_brake",
            ScenarioId::PedestrianCrossing => "pedestrian_crossing",
            ScenarioId::RedLight => "red_light",
            ScenarioId::SlowLead => "slow_lead",
            ScenarioId::ObstacleDetour => "obstacle_detour",
            ScenarioId::SensorFusion => "sensor_fusion",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::StraightCruise => "Empty lane, 0.8 m initial offset, settle below 0.5 m within 5 s",
            ScenarioId::FollowLead => "Lead at 10 m/s, hold a time headway without contact",
            ScenarioId::LeadBrake => "Lead brakes at 6 m/s² from 12 m/s, stop behind it",
            ScenarioId::PedestrianCrossing => "Pedestrian crosses 60 m ahead, yield then continue",
            ScenarioId::RedLight => "Red light 60 m ahead turns green at 8 s",
            ScenarioId::SlowLead => "Lead crawls at 5 m/s, overtake into the free left lane",
            ScenarioId::ObstacleDetour => "Static obstacle in lane, pass it via the left lane",
            ScenarioId::SensorFusion => "Lidar + radar + camera on three vehicles, one track each",
        }
    }

    /// Build the initial world for this scenario.
    pub fn build(&self) -> Scenario {
        let single_lane = Road::default();
        let two_lanes = Road {
            lanes: 2,
            lane_width: 4.0,
            speed_limit: None,
        };
        let base = |road: Road, ego: EgoVehicle, duration: f64| Scenario {
            id: *self,
            road,
            ego,
            actors: Vec::new(),
            lights: Vec::new(),
            junctions: Vec::new(),
            sensors: SensorModel::default_suite(),
            mission: Mission::Cruise,
            duration,
        };

        match self {
            ScenarioId::StraightCruise => base(single_lane, EgoVehicle::new(0.0, 0.8, 0.05, 10.0), 15.0),
            ScenarioId::FollowLead => {
                let mut s = base(single_lane, EgoVehicle::new(0.0, 0.0, 0.0, 12.0), 25.0);
                s.actors.push(ActorSpec::vehicle(40.0, 0.0, 10.0, ActorScript::Cruise));
                s
            }
            ScenarioId::LeadBrake => {
                let mut s = base(single_lane, EgoVehicle::new(0.0, 0.0, 0.0, 12.0), 15.0);
                s.actors.push(ActorSpec::vehicle(
                    35.0,
                    0.0,
                    12.0,
                    ActorScript::BrakeAt { time: 4.0, decel: 6.0 },
                ));
                s
            }
            ScenarioId::PedestrianCrossing => {
                let road = Road {
                    speed_limit: Some(8.0),
                    ..Road::default()
                };
                let mut s = base(road, EgoVehicle::new(0.0, 0.0, 0.0, 8.0), 20.0);
                s.actors.push(ActorSpec {
                    class: ObjectClass::Pedestrian,
                    position: Vector2::new(60.0, -4.0),
                    heading: FRAC_PI_2,
                    speed: 1.4,
                    script: ActorScript::StartAt { time: 3.5, speed: 1.4 },
                });
                s
            }
            ScenarioId::RedLight => {
                let mut s = base(single_lane, EgoVehicle::new(0.0, 0.0, 0.0, 10.0), 20.0);
                s.lights.push(LightScript {
                    x: 60.0,
                    y: 0.0,
                    red_until: 8.0,
                });
                s.junctions.push(Junction {
                    x: 70.0,
                    y: 0.0,
                    radius: 8.0,
                });
                s
            }
            ScenarioId::SlowLead => {
                let mut s = base(two_lanes, EgoVehicle::new(0.0, 0.0, 0.0, 8.0), 20.0);
                s.actors.push(ActorSpec::vehicle(40.0, 0.0, 5.0, ActorScript::Cruise));
                s
            }
            ScenarioId::ObstacleDetour => {
                let mut s = base(two_lanes, EgoVehicle::new(0.0, 0.0, 0.0, 10.0), 20.0);
                s.actors.push(ActorSpec {
                    class: ObjectClass::Static,
                    position: Vector2::new(60.0, 0.0),
                    heading: 0.0,
                    speed: 0.0,
                    script: ActorScript::Cruise,
                });
                s
            }
            ScenarioId::SensorFusion => {
                let road = Road {
                    lanes: 3,
                    ..Road::default()
                };
                let mut s = base(road, EgoVehicle::new(0.0, 3.5, 0.0, 12.0), 15.0);
                s.actors.push(ActorSpec::vehicle(30.0, 3.5, 12.0, ActorScript::Cruise));
                s.actors.push(ActorSpec::vehicle(15.0, 7.0, 13.0, ActorScript::Cruise));
                s.actors.push(ActorSpec::vehicle(-5.0, 0.0, 12.5, ActorScript::Cruise));
                s
            }
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        ScenarioId::all()
            .into_iter()
            .find(|id| id.name() == wanted)
            .ok_or_else(|| SimError::UnknownScenario(s.to_string()))
    }
}

/// An actor to spawn at the start of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorSpec {
    pub class: ObjectClass,
    pub position: Vector2<f64>,
    pub heading: f64,
    pub speed: f64,
    pub script: ActorScript,
}

impl ActorSpec {
    /// A car driving along +x.
    pub fn vehicle(x: f64, y: f64, speed: f64, script: ActorScript) -> Self {
        Self {
            class: ObjectClass::Vehicle,
            position: Vector2::new(x, y),
            heading: 0.0,
            speed,
            script,
        }
    }
}

/// Initial world of one scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: ScenarioId,
    pub road: Road,
    pub ego: EgoVehicle,
    pub actors: Vec<ActorSpec>,
    pub lights: Vec<LightScript>,
    pub junctions: Vec<Junction>,
    pub sensors: Vec<SensorModel>,
    pub mission: Mission,
    /// Default run length (s)
    pub duration: f64,
}

impl Scenario {
    /// Lateral position of the lane the ego starts in.
    pub fn start_lane_center(&self) -> f64 {
        self.road.lane_center(self.road.lane_of(self.ego.y))
    }

    /// Populate an oracle with this world.
    pub fn spawn(&self, physics_seed: u64, vehicle: VehicleConfig) -> Oracle {
        let mut oracle = Oracle::new(physics_seed, vehicle, self.road.clone(), self.ego);
        oracle.set_sensors(self.sensors.clone());
        for actor in &self.actors {
            oracle.spawn_actor(actor.class, actor.position, actor.heading, actor.speed, actor.script);
        }
        for light in &self.lights {
            oracle.add_light(*light);
        }
        for junction in &self.junctions {
            oracle.add_junction(*junction);
        }
        oracle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for id in ScenarioId::all() {
            assert_eq!(id.name().parse::<ScenarioId>().unwrap(), id);
            assert_eq!(id.to_string(), id.name());
        }
        assert_eq!("Lead-Brake".parse::<ScenarioId>().unwrap(), ScenarioId::LeadBrake);
        assert!(matches!(
            "split_brain".parse::<ScenarioId>(),
            Err(SimError::UnknownScenario(_))
        ));
    }

    #[test]
    fn test_spawned_world_matches_scenario() {
        let scenario = ScenarioId::SensorFusion.build();
        let oracle = scenario.spawn(1, VehicleConfig::default());

        assert_eq!(oracle.actors().len(), 3);
        assert_eq!(oracle.ego_lane(), 1);
        assert_eq!(scenario.start_lane_center(), 3.5);
        assert!(scenario.duration > 0.0);
    }

    #[test]
    fn test_red_light_world() {
        let oracle = ScenarioId::RedLight.build().spawn(1, VehicleConfig::default());
        let map = oracle.map_context();
        assert_eq!(map.traffic_lights.len(), 1);
        assert_eq!(map.junctions.len(), 1);
    }
}
