//! Property tests for invariants that must hold on every input.

use nalgebra::Vector3;
use pilot_core::association::{AssociationStrategy, GreedyNearestNeighbor, HungarianAssociation};
use pilot_core::pilot_behavior::{BehaviorContext, Side};
use pilot_core::pilot_planning::count_violations;
use pilot_core::types::{normalize_angle, LightState, Pose2D, SensorKind, TrafficLight};
use pilot_core::{
    BehaviorArbiter, BehaviorState, DetectedObject, MapContext, Mission, ObjectClass, ObjectTracker, Obstacle,
    PathPlanner, PlanRequest, PlannerConfig, SensorBatch, TrackId, TrackedObject, VehicleState,
};
use proptest::prelude::*;
use std::f64::consts::PI;

fn object(class: ObjectClass, x: f64, y: f64, vx: f64) -> TrackedObject {
    TrackedObject {
        id: TrackId(1),
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

fn points(max: usize) -> impl Strategy<Value = Vec<Vector3<f64>>> {
    prop::collection::vec((-20.0..20.0f64, -20.0..20.0f64), 0..max)
        .prop_map(|v| v.into_iter().map(|(x, y)| Vector3::new(x, y, 0.0)).collect())
}

fn mission() -> impl Strategy<Value = Mission> {
    prop_oneof![
        Just(Mission::Cruise),
        Just(Mission::PullOver),
        Just(Mission::Park),
        Just(Mission::Idle),
    ]
}

proptest! {
    #[test]
    fn normalize_angle_stays_in_range(angle in -100.0..100.0f64) {
        let wrapped = normalize_angle(angle);
        prop_assert!(wrapped > -PI && wrapped <= PI);
        prop_assert!((wrapped.sin() - angle.sin()).abs() < 1e-9);
        prop_assert!((wrapped.cos() - angle.cos()).abs() < 1e-9);
    }

    #[test]
    fn association_is_one_to_one(tracks in points(8), detections in points(8), gate in 0.5..10.0f64) {
        let strategies: [&dyn AssociationStrategy; 2] = [&GreedyNearestNeighbor, &HungarianAssociation];
        for strategy in strategies {
            let a = strategy.associate(&tracks, &detections, gate);

            let mut track_seen = vec![false; tracks.len()];
            let mut detection_seen = vec![false; detections.len()];
            for &(t, d) in &a.pairs {
                prop_assert!(!track_seen[t], "{} reused track {}", strategy.name(), t);
                prop_assert!(!detection_seen[d], "{} reused detection {}", strategy.name(), d);
                track_seen[t] = true;
                detection_seen[d] = true;
                prop_assert!((tracks[t] - detections[d]).norm() <= gate);
            }
            prop_assert_eq!(a.pairs.len() + a.unmatched_tracks.len(), tracks.len());
            prop_assert_eq!(a.pairs.len() + a.unmatched_detections.len(), detections.len());
        }
    }

    #[test]
    fn track_ids_are_never_reused(frames in prop::collection::vec(points(5), 1..6)) {
        let mut tracker = ObjectTracker::with_defaults();
        let mut highest: Option<TrackId> = None;
        let mut seen = std::collections::BTreeSet::new();

        for (k, frame) in frames.iter().enumerate() {
            let detections = frame
                .iter()
                .map(|p| DetectedObject::new(p.x, p.y, ObjectClass::Vehicle, 0.9))
                .collect();
            let batch = SensorBatch::new("lidar", SensorKind::Lidar, detections);
            let tracks = tracker.fuse(&[batch], k as f64 * 0.1);

            prop_assert!(tracks.windows(2).all(|w| w[0].id < w[1].id));
            for track in &tracks {
                if seen.insert(track.id) {
                    prop_assert!(highest.map_or(true, |h| track.id > h), "new id {} not above {:?}", track.id, highest);
                    highest = Some(track.id);
                }
            }
        }
    }

    #[test]
    fn imminent_collision_always_wins(
        speed in 5.0..25.0f64,
        ttc in 0.1..1.9f64,
        mission in mission(),
        red_light in any::<bool>(),
    ) {
        let mut arbiter = BehaviorArbiter::with_defaults();
        let config = arbiter.config().clone();
        let gap = ttc * speed;
        let lead = object(
            ObjectClass::Vehicle,
            gap + ObjectClass::Vehicle.footprint_radius() + config.ego_front_extent,
            0.0,
            0.0,
        );
        let mut map = MapContext::default();
        if red_light {
            map.traffic_lights.push(TrafficLight { x: 30.0, y: 0.0, state: LightState::Red });
        }
        let ego = VehicleState::planar(0.0, 0.0, 0.0, speed, 1.0);
        let decision = arbiter.plan(&BehaviorContext {
            ego: &ego,
            objects: std::slice::from_ref(&lead),
            map: &map,
            mission,
            lane_offset: 0.0,
            timestamp: 1.0,
        });

        prop_assert_eq!(decision.state, BehaviorState::Emergency);
        prop_assert_eq!(decision.target_speed, 0.0);
        prop_assert_eq!(decision.priority as usize, arbiter.rules().len());
    }

    #[test]
    fn lane_change_needs_a_clear_side(
        speed in 0.0..30.0f64,
        left_available in any::<bool>(),
        right_available in any::<bool>(),
        neighbour in prop::option::of((-30.0..30.0f64, any::<bool>())),
    ) {
        let mut arbiter = BehaviorArbiter::with_defaults();
        let config = arbiter.config().clone();
        let mut objects = vec![object(ObjectClass::Vehicle, 25.0, 0.0, 0.0)];
        if let Some((dx, left)) = neighbour {
            objects.push(object(ObjectClass::Vehicle, dx, if left { 3.5 } else { -3.5 }, speed));
        }
        let mut map = MapContext::default();
        map.lane.left_available = left_available;
        map.lane.right_available = right_available;
        let ego = VehicleState::planar(0.0, 0.0, 0.0, speed, 0.0);

        let decision = arbiter.plan(&BehaviorContext {
            ego: &ego,
            objects: &objects,
            map: &map,
            mission: Mission::Cruise,
            lane_offset: 0.0,
            timestamp: 0.0,
        });
        let assessment = arbiter.last_assessment().unwrap();

        match decision.state {
            BehaviorState::LaneChangeLeft | BehaviorState::Overtake => {
                prop_assert!(left_available);
                prop_assert!(assessment.left_gap >= config.min_lane_change_gap);
                prop_assert!(speed <= config.max_lane_change_speed);
                prop_assert!(decision.target_lane_offset > 0.0);
            }
            BehaviorState::LaneChangeRight => {
                prop_assert!(right_available);
                prop_assert!(assessment.right_gap >= config.min_lane_change_gap);
                prop_assert!(speed <= config.max_lane_change_speed);
                prop_assert!(decision.target_lane_offset < 0.0);
            }
            _ => {}
        }
    }

    #[test]
    fn lane_change_states_stay_clear_every_tick(
        ticks in prop::collection::vec(
            (14.0..24.0f64, prop::option::of((-30.0..30.0f64, any::<bool>(), 0.0..25.0f64))),
            10..40,
        ),
        right_available in any::<bool>(),
    ) {
        let mut arbiter = BehaviorArbiter::with_defaults();
        let config = arbiter.config().clone();
        let mut map = MapContext::default();
        map.lane.left_available = true;
        map.lane.right_available = right_available;

        for (k, (speed, intruder)) in ticks.into_iter().enumerate() {
            let mut objects = vec![object(ObjectClass::Vehicle, 34.0, 0.0, 3.0)];
            if let Some((dx, left, vx)) = intruder {
                objects.push(object(ObjectClass::Vehicle, dx, if left { 3.5 } else { -3.5 }, vx));
            }
            let t = k as f64 * 0.1;
            let ego = VehicleState::planar(0.0, 0.0, 0.0, speed, t);
            let decision = arbiter.plan(&BehaviorContext {
                ego: &ego,
                objects: &objects,
                map: &map,
                mission: Mission::Cruise,
                lane_offset: 0.0,
                timestamp: t,
            });

            if decision.state.is_lane_change() {
                let side = if decision.target_lane_offset > 0.0 { Side::Left } else { Side::Right };
                let assessment = arbiter.last_assessment().unwrap();
                prop_assert!(
                    assessment.side_clear(side, &config),
                    "tick {}: {} with gap {} at {} m/s",
                    k,
                    decision.state,
                    assessment.gap(side),
                    speed
                );
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn planned_paths_respect_the_margin(
        obstacles in prop::collection::vec((8.0..22.0f64, -6.0..6.0f64, 0.5..1.5f64), 0..5),
    ) {
        let obstacles: Vec<Obstacle> = obstacles.into_iter().map(|(x, y, r)| Obstacle::new(x, y, r)).collect();
        let planner = PathPlanner::with_defaults();
        let request = PlanRequest::new(Pose2D::new(0.0, 0.0, 0.0), Pose2D::new(30.0, 0.0, 0.0))
            .with_speeds(5.0, 10.0)
            .with_obstacles(obstacles.clone());

        if let Ok(trajectory) = planner.plan(&request) {
            let margin = PlannerConfig::default().safety_margin;
            prop_assert!(trajectory.safe);
            prop_assert_eq!(count_violations(&trajectory.waypoints, &obstacles, margin), 0);
            prop_assert_eq!(trajectory.times.len(), trajectory.len());
            prop_assert!(trajectory.times.windows(2).all(|w| w[1] >= w[0]));
        }
    }
}
