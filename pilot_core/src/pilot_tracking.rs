//! The "TRACKING" Engine - Multi-Sensor Object Tracker
//!
//! Turns per-channel detections into persistent, filtered tracks:
//! 1. Predict every track to the batch timestamp (constant-acceleration EKF)
//! 2. Associate each channel's detections against the predicted positions
//! 3. Fuse a track's matched detections into one weighted measurement
//! 4. Correct with a position-only observation model (Joseph form)
//! 5. Prune stale tracks, then spawn tracks from leftover detections
//!
//! Tracks live in a slot arena indexed by a `BTreeMap<TrackId, slot>`, so
//! iteration order (and therefore output order) is stable by id.

use nalgebra::{DMatrix, DVector, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info, warn};

use crate::association::{strategy_for, AssociationStrategy};
use crate::config::{
    require_non_negative, require_positive, require_unit_interval, AssociationMethod,
    ConfigError, TrackingMethod,
};
use crate::linalg::{self, LinalgError};
use crate::types::{DetectedObject, ObjectClass, SensorBatch, SensorKind, TrackId, TrackedObject};

/// [px, py, pz, vx, vy, vz, ax, ay, az]
pub const STATE_DIM: usize = 9;

/// Observation is position only: [px, py, pz]
pub const MEAS_DIM: usize = 3;

/// Floor on a single observation's fusion weight
const MIN_OBSERVATION_WEIGHT: f64 = 1e-3;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Trust placed in each sensor modality during fusion, in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorReliability {
    pub camera: f64,
    pub lidar: f64,
    pub radar: f64,
    pub ultrasonic: f64,
}

impl Default for SensorReliability {
    fn default() -> Self {
        Self {
            camera: 0.7,
            lidar: 0.95,
            radar: 0.8,
            ultrasonic: 0.5,
        }
    }
}

impl SensorReliability {
    pub fn for_kind(&self, kind: SensorKind) -> f64 {
        match kind {
            SensorKind::Camera => self.camera,
            SensorKind::Lidar => self.lidar,
            SensorKind::Radar => self.radar,
            SensorKind::Ultrasonic => self.ultrasonic,
        }
    }
}

/// Configuration for the ObjectTracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// State estimator (only EKF is implemented)
    pub method: TrackingMethod,

    /// Detection-to-track assignment strategy (default: greedy)
    pub association: AssociationMethod,

    /// Association gate in meters (default: 3.0)
    pub max_association_distance: f64,

    /// Seconds without an update before deletion (default: 1.0)
    pub max_age: f64,

    /// Consecutive misses tolerated before deletion (default: 5)
    pub max_misses: u32,

    /// Snapshots kept per track (default: 50 = 5s at 10 Hz)
    pub history_len: usize,

    /// White-jerk spectral density for process noise, m/s³ (default: 2.0)
    pub process_noise_jerk: f64,

    /// Per-axis detection position noise, m (default: 0.5)
    pub measurement_noise_std: f64,

    pub initial_position_std: f64,
    pub initial_velocity_std: f64,
    pub initial_acceleration_std: f64,

    /// Existence score given to a newborn track (default: 0.3)
    pub initial_confidence: f64,

    /// Fraction of the remaining gap closed per hit (default: 0.3)
    pub confirm_gain: f64,

    /// Existence multiplier on a miss (default: 0.8)
    pub miss_decay: f64,

    /// Existence multiplier when a correction is skipped (default: 0.7)
    pub singular_decay: f64,

    /// Position variance at which certainty halves, m² (default: 1.0)
    pub base_position_variance: f64,

    pub reliability: SensorReliability,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            method: TrackingMethod::Ekf,
            association: AssociationMethod::Greedy,
            max_association_distance: 3.0,
            max_age: 1.0,
            max_misses: 5,
            history_len: 50,
            process_noise_jerk: 2.0,
            measurement_noise_std: 0.5,
            initial_position_std: 1.0,
            initial_velocity_std: 5.0,
            initial_acceleration_std: 2.0,
            initial_confidence: 0.3,
            confirm_gain: 0.3,
            miss_decay: 0.8,
            singular_decay: 0.7,
            base_position_variance: 1.0,
            reliability: SensorReliability::default(),
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("tracker.max_association_distance", self.max_association_distance)?;
        require_positive("tracker.max_age", self.max_age)?;
        require_non_negative("tracker.process_noise_jerk", self.process_noise_jerk)?;
        require_non_negative("tracker.measurement_noise_std", self.measurement_noise_std)?;
        require_non_negative("tracker.initial_position_std", self.initial_position_std)?;
        require_non_negative("tracker.initial_velocity_std", self.initial_velocity_std)?;
        require_non_negative("tracker.initial_acceleration_std", self.initial_acceleration_std)?;
        require_positive("tracker.base_position_variance", self.base_position_variance)?;
        for (name, value) in [
            ("tracker.initial_confidence", self.initial_confidence),
            ("tracker.confirm_gain", self.confirm_gain),
            ("tracker.miss_decay", self.miss_decay),
            ("tracker.singular_decay", self.singular_decay),
            ("tracker.reliability.camera", self.reliability.camera),
            ("tracker.reliability.lidar", self.reliability.lidar),
            ("tracker.reliability.radar", self.reliability.radar),
            ("tracker.reliability.ultrasonic", self.reliability.ultrasonic),
        ] {
            require_unit_interval(name, value)?;
        }
        Ok(())
    }
}

// ============================================================================
// KINEMATIC FILTER (EKF, constant acceleration)
// ============================================================================

/// Outcome of a measurement correction.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Correction applied; carries the normalized innovation squared
    Applied { nis: f64 },
    /// Innovation covariance could not be inverted, state left untouched
    Skipped(LinalgError),
}

/// Extended Kalman filter over a 9-dimensional constant-acceleration state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KinematicFilter {
    /// [px, py, pz, vx, vy, vz, ax, ay, az]
    pub state: DVector<f64>,

    /// 9×9 state covariance
    pub covariance: DMatrix<f64>,

    /// White-jerk spectral density σ_j (m/s³)
    pub process_noise_jerk: f64,
}

impl KinematicFilter {
    pub fn new(state: DVector<f64>, covariance: DMatrix<f64>, process_noise_jerk: f64) -> Self {
        debug_assert_eq!(state.len(), STATE_DIM);
        debug_assert_eq!(covariance.shape(), (STATE_DIM, STATE_DIM));
        Self {
            state,
            covariance,
            process_noise_jerk,
        }
    }

    /// Start at `position` (and `velocity` if known) with one uncorrelated
    /// uncertainty block per derivative.
    pub fn from_position(
        position: Vector3<f64>,
        velocity: Option<Vector3<f64>>,
        config: &TrackerConfig,
    ) -> Self {
        let v = velocity.unwrap_or_else(Vector3::zeros);
        let state = DVector::from_vec(vec![
            position.x, position.y, position.z, v.x, v.y, v.z, 0.0, 0.0, 0.0,
        ]);

        let pos_var = config.initial_position_std.powi(2);
        let vel_var = config.initial_velocity_std.powi(2);
        let acc_var = config.initial_acceleration_std.powi(2);
        let covariance = linalg::block_diagonal(&[
            DMatrix::identity(3, 3) * pos_var,
            DMatrix::identity(3, 3) * vel_var,
            DMatrix::identity(3, 3) * acc_var,
        ]);

        Self::new(state, covariance, config.process_noise_jerk)
    }

    /// Constant-acceleration transition:
    /// p' = p + v·dt + ½a·dt², v' = v + a·dt, a' = a
    pub fn transition_matrix(dt: f64) -> DMatrix<f64> {
        let mut f = DMatrix::identity(STATE_DIM, STATE_DIM);
        for axis in 0..3 {
            f[(axis, axis + 3)] = dt;
            f[(axis, axis + 6)] = 0.5 * dt * dt;
            f[(axis + 3, axis + 6)] = dt;
        }
        f
    }

    /// Discrete white-jerk process noise, one 3×3 block per axis.
    pub fn process_noise(dt: f64, sigma_jerk: f64) -> DMatrix<f64> {
        let q = sigma_jerk * sigma_jerk;
        let (dt2, dt3) = (dt * dt, dt * dt * dt);
        let (dt4, dt5) = (dt3 * dt, dt3 * dt2);
        let block = [
            [dt5 / 20.0, dt4 / 8.0, dt3 / 6.0],
            [dt4 / 8.0, dt3 / 3.0, dt2 / 2.0],
            [dt3 / 6.0, dt2 / 2.0, dt],
        ];

        let mut out = DMatrix::zeros(STATE_DIM, STATE_DIM);
        for axis in 0..3 {
            for (r, row) in block.iter().enumerate() {
                for (c, value) in row.iter().enumerate() {
                    out[(axis + 3 * r, axis + 3 * c)] = q * value;
                }
            }
        }
        out
    }

    /// H = [I₃ 0 0]
    pub fn observation_matrix() -> DMatrix<f64> {
        let mut h = DMatrix::zeros(MEAS_DIM, STATE_DIM);
        for axis in 0..MEAS_DIM {
            h[(axis, axis)] = 1.0;
        }
        h
    }

    /// Propagate state and covariance forward by `dt` seconds.
    pub fn predict(&mut self, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        let f = Self::transition_matrix(dt);
        let q = Self::process_noise(dt, self.process_noise_jerk);

        self.state = &f * &self.state;
        self.covariance = linalg::symmetrize(&(&f * &self.covariance * f.transpose() + q));
    }

    /// Correct with a position measurement `z` (3-vector) and noise `r` (3×3).
    ///
    /// If the innovation covariance is singular the state is left as the
    /// prediction and the reason is returned.
    pub fn update(&mut self, z: &DVector<f64>, r: &DMatrix<f64>) -> UpdateOutcome {
        let h = Self::observation_matrix();

        let innovation = z - &h * &self.state;
        let s = &h * &self.covariance * h.transpose() + r;
        let s_inv = match linalg::invert(&s) {
            Ok(inv) => inv,
            Err(err) => return UpdateOutcome::Skipped(err),
        };

        let k = &self.covariance * h.transpose() * &s_inv;
        self.state += &k * &innovation;

        // Joseph form keeps P symmetric positive semi-definite
        let i_kh = DMatrix::identity(STATE_DIM, STATE_DIM) - &k * &h;
        let joseph = &i_kh * &self.covariance * i_kh.transpose() + &k * r * k.transpose();
        self.covariance = linalg::symmetrize(&joseph);

        let nis = (innovation.transpose() * &s_inv * &innovation)[(0, 0)];
        UpdateOutcome::Applied { nis }
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.state[0], self.state[1], self.state[2])
    }

    pub fn velocity(&self) -> Vector3<f64> {
        Vector3::new(self.state[3], self.state[4], self.state[5])
    }

    pub fn acceleration(&self) -> Vector3<f64> {
        Vector3::new(self.state[6], self.state[7], self.state[8])
    }

    /// Trace of the position block of P (m²)
    pub fn position_variance(&self) -> f64 {
        (0..3).map(|i| self.covariance[(i, i)]).sum()
    }
}

// ============================================================================
// TRACK (Internal State)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub timestamp: f64,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
}

/// One physical object as maintained by the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub filter: KinematicFilter,
    pub class: ObjectClass,

    /// Existence score in [0, 1], raised by hits and decayed by misses
    pub existence: f64,

    pub consecutive_hits: u32,
    pub consecutive_misses: u32,
    pub total_updates: u64,

    pub created_at: f64,
    /// Time of the last associated detection
    pub last_update: f64,
    /// Time the filter state refers to
    pub state_time: f64,

    pub history: VecDeque<TrackSnapshot>,
}

impl Track {
    fn register_hit(&mut self, now: f64, confirm_gain: f64) {
        self.consecutive_hits = self.consecutive_hits.saturating_add(1);
        self.consecutive_misses = 0;
        self.total_updates += 1;
        self.last_update = now;
        self.existence += (1.0 - self.existence) * confirm_gain;
    }

    fn register_miss(&mut self, miss_decay: f64) {
        self.consecutive_misses = self.consecutive_misses.saturating_add(1);
        self.consecutive_hits = 0;
        self.existence *= miss_decay;
    }

    fn record_snapshot(&mut self, now: f64, capacity: usize) {
        if capacity == 0 {
            return;
        }
        self.history.push_back(TrackSnapshot {
            timestamp: now,
            position: self.filter.position(),
            velocity: self.filter.velocity(),
        });
        while self.history.len() > capacity {
            self.history.pop_front();
        }
    }

    /// Seconds since the last associated detection
    pub fn age(&self, now: f64) -> f64 {
        (now - self.last_update).max(0.0)
    }

    /// Existence scaled by positional certainty, in [0, 1].
    pub fn confidence(&self, base_position_variance: f64) -> f64 {
        let per_axis = self.filter.position_variance() / 3.0;
        let certainty = base_position_variance / (base_position_variance + per_axis.max(0.0));
        (self.existence * certainty).clamp(0.0, 1.0)
    }

    pub fn to_tracked_object(
        &self,
        now: f64,
        reference: &Vector3<f64>,
        base_position_variance: f64,
    ) -> TrackedObject {
        let position = self.filter.position();
        let velocity = self.filter.velocity();
        let speed = velocity.x.hypot(velocity.y);

        TrackedObject {
            id: self.id,
            class: self.class,
            position,
            velocity,
            acceleration: self.filter.acceleration(),
            speed,
            heading: velocity.y.atan2(velocity.x),
            distance: (position - reference).norm(),
            confidence: self.confidence(base_position_variance),
            age: self.age(now),
            consecutive_hits: self.consecutive_hits,
            consecutive_misses: self.consecutive_misses,
            last_update: self.last_update,
        }
    }
}

// ============================================================================
// TRACK REGISTRY (arena + ordered index)
// ============================================================================

/// Owns every live track. Ids are never reused, even across `clear()`.
#[derive(Debug, Default)]
pub struct TrackRegistry {
    slots: Vec<Option<Track>>,
    free: Vec<usize>,
    index: BTreeMap<TrackId, usize>,
    next_id: u64,
}

impl TrackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_id(&mut self) -> TrackId {
        self.next_id += 1;
        TrackId(self.next_id)
    }

    pub fn insert(&mut self, track: Track) {
        let id = track.id;
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(track);
                slot
            }
            None => {
                self.slots.push(Some(track));
                self.slots.len() - 1
            }
        };
        self.index.insert(id, slot);
    }

    pub fn remove(&mut self, id: TrackId) -> Option<Track> {
        let slot = self.index.remove(&id)?;
        self.free.push(slot);
        self.slots[slot].take()
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.index.get(&id).and_then(|&slot| self.slots[slot].as_ref())
    }

    pub fn get_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        let slot = *self.index.get(&id)?;
        self.slots[slot].as_mut()
    }

    /// Tracks in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.index
            .values()
            .filter_map(move |&slot| self.slots[slot].as_ref())
    }

    pub fn ids(&self) -> Vec<TrackId> {
        self.index.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Drop all tracks but keep the id counter running.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
    }
}

// ============================================================================
// FUSION
// ============================================================================

/// A detection with its fusion weight (confidence × sensor reliability).
#[derive(Debug, Clone)]
struct WeightedObservation {
    position: Vector3<f64>,
    velocity: Option<Vector3<f64>>,
    class: ObjectClass,
    weight: f64,
}

impl WeightedObservation {
    fn new(detection: &DetectedObject, reliability: f64) -> Self {
        Self {
            position: detection.position,
            velocity: detection.velocity,
            class: detection.class,
            weight: (detection.confidence.clamp(0.0, 1.0) * reliability).max(MIN_OBSERVATION_WEIGHT),
        }
    }
}

/// Reliability-weighted pseudo-measurement built from several channels.
#[derive(Debug, Clone)]
struct FusedMeasurement {
    position: Vector3<f64>,
    velocity: Option<Vector3<f64>>,
    class: ObjectClass,
    total_weight: f64,
}

fn fuse_observations(observations: &[WeightedObservation]) -> FusedMeasurement {
    let total_weight: f64 = observations.iter().map(|o| o.weight).sum();
    let position = observations
        .iter()
        .fold(Vector3::zeros(), |acc, o| acc + o.position * o.weight)
        / total_weight;

    let (vel_sum, vel_weight) = observations
        .iter()
        .filter_map(|o| o.velocity.map(|v| (v, o.weight)))
        .fold((Vector3::zeros(), 0.0), |(sum, w), (v, ow)| (sum + v * ow, w + ow));
    let velocity = (vel_weight > 0.0).then(|| vel_sum / vel_weight);

    // Weighted class vote; earlier observations win ties
    let mut votes: Vec<(ObjectClass, f64)> = Vec::new();
    for o in observations {
        match votes.iter_mut().find(|(c, _)| *c == o.class) {
            Some((_, w)) => *w += o.weight,
            None => votes.push((o.class, o.weight)),
        }
    }
    let class = votes
        .iter()
        .fold(None::<(ObjectClass, f64)>, |best, &(c, w)| match best {
            Some((_, bw)) if bw >= w => best,
            _ => Some((c, w)),
        })
        .map_or(ObjectClass::Unknown, |(c, _)| c);

    FusedMeasurement {
        position,
        velocity,
        class,
        total_weight,
    }
}

/// Unmatched detection awaiting track birth, tagged with its channel.
#[derive(Debug, Clone)]
struct BirthCandidate {
    channel: usize,
    observation: WeightedObservation,
}

// ============================================================================
// OBJECT TRACKER (The Main Engine)
// ============================================================================

/// Running counters, useful for logs and validation reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerStats {
    pub cycles: u64,
    pub tracks_created: u64,
    pub tracks_deleted: u64,
    pub updates_applied: u64,
    pub updates_skipped: u64,
    pub detections_dropped: u64,
}

pub struct ObjectTracker {
    config: TrackerConfig,
    registry: TrackRegistry,
    strategy: Box<dyn AssociationStrategy>,
    /// Point distances are measured from (usually the ego position)
    reference: Vector3<f64>,
    stats: TrackerStats,
}

impl std::fmt::Debug for ObjectTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectTracker")
            .field("tracks", &self.registry.len())
            .field("strategy", &self.strategy.name())
            .field("stats", &self.stats)
            .finish()
    }
}

impl ObjectTracker {
    /// Build a tracker; fails for estimators that are not implemented.
    pub fn new(config: TrackerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        match config.method {
            TrackingMethod::Ekf => {}
            other => {
                return Err(ConfigError::Unsupported(format!(
                    "tracking method '{other}' is not implemented"
                )))
            }
        }
        let strategy = strategy_for(config.association);
        Ok(Self::build(config, strategy))
    }

    pub fn with_defaults() -> Self {
        let config = TrackerConfig::default();
        let strategy = strategy_for(config.association);
        Self::build(config, strategy)
    }

    fn build(config: TrackerConfig, strategy: Box<dyn AssociationStrategy>) -> Self {
        Self {
            config,
            registry: TrackRegistry::new(),
            strategy,
            reference: Vector3::zeros(),
            stats: TrackerStats::default(),
        }
    }

    /// Swap in a custom association policy.
    pub fn with_strategy(mut self, strategy: Box<dyn AssociationStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn set_reference(&mut self, reference: Vector3<f64>) {
        self.reference = reference;
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn stats(&self) -> &TrackerStats {
        &self.stats
    }

    pub fn track_count(&self) -> usize {
        self.registry.len()
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.registry.get(id)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.registry.iter()
    }

    /// Recent snapshots of one track, oldest first.
    pub fn history(&self, id: TrackId) -> Option<&VecDeque<TrackSnapshot>> {
        self.registry.get(id).map(|t| &t.history)
    }

    /// Drop every track. Ids keep counting up.
    pub fn reset(&mut self) {
        let dropped = self.registry.len();
        self.registry.clear();
        info!(dropped, "tracker reset");
    }

    /// Run one fusion cycle at time `now` and return the tracks that survive it.
    pub fn fuse(&mut self, batches: &[SensorBatch], now: f64) -> Vec<TrackedObject> {
        self.stats.cycles += 1;

        // 1. Predict
        self.predict_all(now);

        // 2. Associate, channel by channel
        let predicted: Vec<(TrackId, Vector3<f64>)> = self
            .registry
            .iter()
            .map(|t| (t.id, t.filter.position()))
            .collect();
        let track_positions: Vec<Vector3<f64>> = predicted.iter().map(|(_, p)| *p).collect();

        let mut matched: BTreeMap<TrackId, Vec<WeightedObservation>> = BTreeMap::new();
        let mut births: Vec<BirthCandidate> = Vec::new();

        for (channel, batch) in batches.iter().enumerate() {
            let reliability = self.config.reliability.for_kind(batch.kind);
            let detections: Vec<&DetectedObject> =
                batch.detections.iter().filter(|d| d.is_finite()).collect();

            let dropped = batch.detections.len() - detections.len();
            if dropped > 0 {
                self.stats.detections_dropped += dropped as u64;
                warn!(channel = %batch.channel, dropped, "dropping non-finite detections");
            }

            let positions: Vec<Vector3<f64>> = detections.iter().map(|d| d.position).collect();
            let assignment = self.strategy.associate(
                &track_positions,
                &positions,
                self.config.max_association_distance,
            );

            for (ti, di) in assignment.pairs {
                matched
                    .entry(predicted[ti].0)
                    .or_default()
                    .push(WeightedObservation::new(detections[di], reliability));
            }
            for di in assignment.unmatched_detections {
                births.push(BirthCandidate {
                    channel,
                    observation: WeightedObservation::new(detections[di], reliability),
                });
            }
        }

        // 3 + 4. Fuse and correct, or register a miss
        for (id, _) in &predicted {
            match matched.get(id) {
                Some(observations) => self.correct_track(*id, observations, now),
                None => {
                    if let Some(track) = self.registry.get_mut(*id) {
                        track.register_miss(self.config.miss_decay);
                    }
                }
            }
            if let Some(track) = self.registry.get_mut(*id) {
                track.record_snapshot(now, self.config.history_len);
            }
        }

        // 5. Lifecycle
        self.prune(now);
        self.spawn_tracks(births, now);

        debug!(
            tracks = self.registry.len(),
            channels = batches.len(),
            "fusion cycle complete"
        );
        self.tracked_objects(now)
    }

    /// Current tracks as seen at `now`, in id order.
    pub fn tracked_objects(&self, now: f64) -> Vec<TrackedObject> {
        self.registry
            .iter()
            .map(|t| t.to_tracked_object(now, &self.reference, self.config.base_position_variance))
            .collect()
    }

    fn predict_all(&mut self, now: f64) {
        for id in self.registry.ids() {
            if let Some(track) = self.registry.get_mut(id) {
                let dt = now - track.state_time;
                if dt > 0.0 {
                    track.filter.predict(dt);
                    track.state_time = now;
                } else if dt < 0.0 {
                    debug!(track = %id, dt, "batch older than track state, skipping predict");
                }
            }
        }
    }

    fn measurement_noise(&self, total_weight: f64) -> DMatrix<f64> {
        // More (and more reliable) evidence shrinks R, within a 4x band
        let scale = 1.0 / total_weight.clamp(0.25, 4.0);
        DMatrix::identity(MEAS_DIM, MEAS_DIM) * (self.config.measurement_noise_std.powi(2) * scale)
    }

    fn correct_track(&mut self, id: TrackId, observations: &[WeightedObservation], now: f64) {
        let fused = fuse_observations(observations);
        let r = self.measurement_noise(fused.total_weight);
        let z = DVector::from_column_slice(fused.position.as_slice());

        let Some(track) = self.registry.get_mut(id) else {
            return;
        };

        match track.filter.update(&z, &r) {
            UpdateOutcome::Applied { nis } => {
                track.register_hit(now, self.config.confirm_gain);
                if fused.class != ObjectClass::Unknown {
                    track.class = fused.class;
                }
                self.stats.updates_applied += 1;
                debug!(track = %id, nis, sources = observations.len(), "track corrected");
            }
            UpdateOutcome::Skipped(err) => {
                // Seen but not corrected: keep it alive, trust it less
                track.consecutive_misses = 0;
                track.last_update = now;
                track.existence *= self.config.singular_decay;
                self.stats.updates_skipped += 1;
                warn!(track = %id, error = %err, "innovation covariance not invertible, keeping prediction");
            }
        }
    }

    fn prune(&mut self, now: f64) {
        let stale: Vec<TrackId> = self
            .registry
            .iter()
            .filter(|t| {
                t.consecutive_misses > self.config.max_misses || t.age(now) > self.config.max_age
            })
            .map(|t| t.id)
            .collect();

        for id in stale {
            if let Some(track) = self.registry.remove(id) {
                self.stats.tracks_deleted += 1;
                debug!(
                    track = %id,
                    misses = track.consecutive_misses,
                    age = track.age(now),
                    "track deleted"
                );
            }
        }
    }

    /// Group leftover detections across channels (one per channel per
    /// group, within the association gate) and start a track per group.
    fn spawn_tracks(&mut self, candidates: Vec<BirthCandidate>, now: f64) {
        let gate = self.config.max_association_distance;
        let mut used = vec![false; candidates.len()];

        for i in 0..candidates.len() {
            if used[i] {
                continue;
            }
            used[i] = true;
            let seed = &candidates[i];
            let mut group = vec![seed.observation.clone()];
            let mut channels = vec![seed.channel];

            for j in (i + 1)..candidates.len() {
                let other = &candidates[j];
                if used[j] || channels.contains(&other.channel) {
                    continue;
                }
                if (other.observation.position - seed.observation.position).norm() <= gate {
                    used[j] = true;
                    channels.push(other.channel);
                    group.push(other.observation.clone());
                }
            }

            let fused = fuse_observations(&group);
            self.create_track(&fused, now);
        }
    }

    fn create_track(&mut self, fused: &FusedMeasurement, now: f64) {
        let id = self.registry.allocate_id();
        let mut track = Track {
            id,
            filter: KinematicFilter::from_position(fused.position, fused.velocity, &self.config),
            class: fused.class,
            existence: self.config.initial_confidence,
            consecutive_hits: 1,
            consecutive_misses: 0,
            total_updates: 1,
            created_at: now,
            last_update: now,
            state_time: now,
            history: VecDeque::with_capacity(self.config.history_len),
        };
        track.record_snapshot(now, self.config.history_len);
        self.registry.insert(track);
        self.stats.tracks_created += 1;
        debug!(track = %id, x = fused.position.x, y = fused.position.y, "track created");
    }
}

impl Default for ObjectTracker {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn lidar(dets: Vec<DetectedObject>) -> SensorBatch {
        SensorBatch::new("front_lidar", SensorKind::Lidar, dets)
    }

    fn vehicle_at(x: f64, y: f64) -> DetectedObject {
        DetectedObject::new(x, y, ObjectClass::Vehicle, 0.9)
    }

    #[test]
    fn test_transition_matrix_constant_acceleration() {
        let f = KinematicFilter::transition_matrix(0.5);
        let mut x = DVector::zeros(STATE_DIM);
        x[3] = 2.0; // vx
        x[6] = 4.0; // ax
        let next = &f * &x;

        assert_relative_eq!(next[0], 2.0 * 0.5 + 0.5 * 4.0 * 0.25, epsilon = 1e-12);
        assert_relative_eq!(next[3], 2.0 + 4.0 * 0.5, epsilon = 1e-12);
        assert_relative_eq!(next[6], 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_initial_covariance_blocks() {
        let config = TrackerConfig::default();
        let filter = KinematicFilter::from_position(Vector3::new(1.0, 2.0, 0.0), None, &config);
        let p = &filter.covariance;

        assert_eq!(p.shape(), (STATE_DIM, STATE_DIM));
        for axis in 0..3 {
            assert_relative_eq!(p[(axis, axis)], 1.0);
            assert_relative_eq!(p[(axis + 3, axis + 3)], 25.0);
            assert_relative_eq!(p[(axis + 6, axis + 6)], 4.0);
        }
        assert_eq!(p.iter().filter(|v| **v != 0.0).count(), STATE_DIM);
    }

    #[test]
    fn test_predict_grows_covariance() {
        let config = TrackerConfig::default();
        let mut filter = KinematicFilter::from_position(Vector3::zeros(), None, &config);
        let before = filter.position_variance();
        filter.predict(0.1);

        assert!(filter.position_variance() > before);
        assert!(linalg::is_symmetric(&filter.covariance, 1e-9));
    }

    #[test]
    fn test_update_shrinks_covariance_and_pulls_state() {
        let config = TrackerConfig::default();
        let mut filter = KinematicFilter::from_position(Vector3::zeros(), None, &config);
        let before = filter.position_variance();

        let z = DVector::from_vec(vec![1.0, 0.0, 0.0]);
        let r = DMatrix::identity(3, 3) * 0.25;
        let outcome = filter.update(&z, &r);

        assert!(matches!(outcome, UpdateOutcome::Applied { .. }));
        assert!(filter.position_variance() < before);
        // Prior var 1.0, R 0.25: gain 0.8
        assert_relative_eq!(filter.state[0], 0.8, epsilon = 1e-9);
    }

    #[test]
    fn test_update_skipped_on_singular_innovation() {
        let mut filter = KinematicFilter::new(
            DVector::zeros(STATE_DIM),
            DMatrix::zeros(STATE_DIM, STATE_DIM),
            0.0,
        );
        let z = DVector::from_vec(vec![5.0, 5.0, 0.0]);
        let outcome = filter.update(&z, &DMatrix::zeros(3, 3));

        assert!(matches!(outcome, UpdateOutcome::Skipped(LinalgError::Singular { .. })));
        assert_eq!(filter.state[0], 0.0);
    }

    #[test]
    fn test_unsupported_methods_rejected() {
        for method in [TrackingMethod::Ukf, TrackingMethod::Particle] {
            let config = TrackerConfig {
                method,
                ..TrackerConfig::default()
            };
            assert!(matches!(ObjectTracker::new(config), Err(ConfigError::Unsupported(_))));
        }
        assert!(ObjectTracker::new(TrackerConfig::default()).is_ok());
    }

    #[test]
    fn test_fuse_creates_track() {
        let mut tracker = ObjectTracker::with_defaults();
        let out = tracker.fuse(&[lidar(vec![vehicle_at(10.0, 2.0)])], 0.0);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class, ObjectClass::Vehicle);
        assert_relative_eq!(out[0].position.x, 10.0, epsilon = 1e-9);
        assert!(out[0].confidence > 0.0 && out[0].confidence <= 1.0);
    }

    #[test]
    fn test_constant_velocity_convergence() {
        let mut tracker = ObjectTracker::with_defaults();
        let dt = 0.1;
        let mut last = Vec::new();

        for k in 0..60 {
            let t = k as f64 * dt;
            last = tracker.fuse(&[lidar(vec![vehicle_at(5.0 + 10.0 * t, 3.0)])], t);
        }

        assert_eq!(last.len(), 1);
        let truth_x = 5.0 + 10.0 * 59.0 * dt;
        assert!((last[0].position.x - truth_x).abs() < 0.1, "x = {}", last[0].position.x);
        assert!((last[0].position.y - 3.0).abs() < 0.1);
        assert!((last[0].speed - 10.0).abs() < 0.5, "speed = {}", last[0].speed);
        assert!(last[0].heading.abs() < 0.05);
    }

    #[test]
    fn test_two_channels_fuse_into_one_track() {
        let mut tracker = ObjectTracker::with_defaults();
        let batches = [
            SensorBatch::new("lidar", SensorKind::Lidar, vec![vehicle_at(10.0, 0.0)]),
            SensorBatch::new("camera", SensorKind::Camera, vec![vehicle_at(10.6, 0.0)]),
        ];
        let out = tracker.fuse(&batches, 0.0);

        assert_eq!(out.len(), 1);
        // Weighted toward the more reliable lidar
        assert!(out[0].position.x > 10.0 && out[0].position.x < 10.3);

        let out = tracker.fuse(&batches, 0.1);
        assert_eq!(out.len(), 1);
        assert_eq!(tracker.stats().tracks_created, 1);
    }

    #[test]
    fn test_same_channel_detections_stay_separate() {
        let mut tracker = ObjectTracker::with_defaults();
        let out = tracker.fuse(&[lidar(vec![vehicle_at(10.0, 0.0), vehicle_at(11.0, 0.0)])], 0.0);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_deleted_after_too_many_misses() {
        let config = TrackerConfig {
            max_misses: 2,
            max_age: 100.0,
            ..TrackerConfig::default()
        };
        let mut tracker = ObjectTracker::new(config).unwrap();
        tracker.fuse(&[lidar(vec![vehicle_at(0.0, 0.0)])], 0.0);

        assert_eq!(tracker.fuse(&[], 0.1).len(), 1);
        assert_eq!(tracker.fuse(&[], 0.2).len(), 1);
        assert_eq!(tracker.fuse(&[], 0.3).len(), 0);
        assert_eq!(tracker.stats().tracks_deleted, 1);
    }

    #[test]
    fn test_deleted_after_max_age() {
        let config = TrackerConfig {
            max_misses: 100,
            max_age: 0.5,
            ..TrackerConfig::default()
        };
        let mut tracker = ObjectTracker::new(config).unwrap();
        tracker.fuse(&[lidar(vec![vehicle_at(0.0, 0.0)])], 0.0);

        let out = tracker.fuse(&[], 0.5);
        assert_eq!(out.len(), 1);
        assert_relative_eq!(out[0].age, 0.5, epsilon = 1e-12);
        assert_eq!(tracker.fuse(&[], 0.6).len(), 0);
    }

    #[test]
    fn test_ids_unique_and_not_reused_after_reset() {
        let mut tracker = ObjectTracker::with_defaults();
        let first = tracker.fuse(&[lidar(vec![vehicle_at(0.0, 0.0), vehicle_at(50.0, 0.0)])], 0.0);
        tracker.reset();
        assert_eq!(tracker.track_count(), 0);

        let second = tracker.fuse(&[lidar(vec![vehicle_at(0.0, 0.0)])], 1.0);
        let max_first = first.iter().map(|t| t.id).max().unwrap();

        assert_ne!(first[0].id, first[1].id);
        assert!(second[0].id > max_first);
    }

    #[test]
    fn test_singular_update_keeps_track_and_decays_confidence() {
        let config = TrackerConfig {
            measurement_noise_std: 0.0,
            initial_position_std: 0.0,
            initial_velocity_std: 0.0,
            initial_acceleration_std: 0.0,
            process_noise_jerk: 0.0,
            ..TrackerConfig::default()
        };
        let mut tracker = ObjectTracker::new(config).unwrap();
        tracker.fuse(&[lidar(vec![vehicle_at(1.0, 1.0)])], 0.0);
        let before = tracker.tracks().next().unwrap().existence;

        let out = tracker.fuse(&[lidar(vec![vehicle_at(1.5, 1.0)])], 0.1);

        assert_eq!(out.len(), 1);
        assert_relative_eq!(out[0].position.x, 1.0, epsilon = 1e-12);
        assert!(tracker.tracks().next().unwrap().existence < before);
        assert_eq!(tracker.stats().updates_skipped, 1);
    }

    #[test]
    fn test_non_finite_detections_dropped() {
        let mut tracker = ObjectTracker::with_defaults();
        let out = tracker.fuse(
            &[lidar(vec![vehicle_at(f64::NAN, 0.0), vehicle_at(3.0, 0.0)])],
            0.0,
        );

        assert_eq!(out.len(), 1);
        assert_eq!(tracker.stats().detections_dropped, 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let config = TrackerConfig {
            history_len: 4,
            ..TrackerConfig::default()
        };
        let mut tracker = ObjectTracker::new(config).unwrap();
        let mut id = None;
        for k in 0..10 {
            let out = tracker.fuse(&[lidar(vec![vehicle_at(k as f64 * 0.5, 0.0)])], k as f64 * 0.1);
            id = Some(out[0].id);
        }

        let history = tracker.history(id.unwrap()).unwrap();
        assert_eq!(history.len(), 4);
        assert!(history.iter().zip(history.iter().skip(1)).all(|(a, b)| b.timestamp > a.timestamp));
    }

    #[test]
    fn test_distance_from_reference() {
        let mut tracker = ObjectTracker::with_defaults();
        tracker.set_reference(Vector3::new(3.0, 0.0, 0.0));
        let out = tracker.fuse(&[lidar(vec![vehicle_at(3.0, 4.0)])], 0.0);
        assert_relative_eq!(out[0].distance, 4.0, epsilon = 1e-9);
    }
}
