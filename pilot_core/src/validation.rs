//! Validation Module - Ground Truth Comparison for Closed-Loop Runs
//! =================================================================
//!
//! Scores the stack against the simulator's ground truth:
//! - Track position error (RMSE, max error) per actor
//! - Coverage (fraction of actor-frames with a matching track)
//! - Ghost tracks (tracks with no actor nearby)
//! - Identity switches (an actor's matching track id changes)
//! - Lateral tracking error of the controller
//!
//! Usage:
//! ```ignore
//! use pilot_core::validation::{GroundTruth, ValidationSession};
//!
//! let mut session = ValidationSession::new();
//! session.record_frame(&truth, &output.tracks);
//! session.record_control(&output.command.error);
//! let report = session.generate_report();
//! ```

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{TrackId, TrackedObject, TrackingError};

// =============================================================================
// GROUND TRUTH
// =============================================================================

/// True state of one simulated actor at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct GroundTruth {
    pub actor_id: u32,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
}

// =============================================================================
// VALIDATION METRICS
// =============================================================================

/// Per-actor tracking statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActorMetrics {
    /// Frames in which the actor existed
    pub frames: usize,
    /// Frames in which some track matched it
    pub matched_frames: usize,
    pub error_sum_squared: f64,
    pub max_error: f64,
    pub id_switches: usize,
    /// Last track matched to this actor
    pub last_track: Option<TrackId>,
}

impl ActorMetrics {
    /// Root mean square position error over matched frames.
    pub fn rmse(&self) -> f64 {
        if self.matched_frames > 0 {
            (self.error_sum_squared / self.matched_frames as f64).sqrt()
        } else {
            0.0
        }
    }

    pub fn coverage(&self) -> f64 {
        if self.frames > 0 {
            self.matched_frames as f64 / self.frames as f64
        } else {
            0.0
        }
    }
}

/// Session-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalMetrics {
    pub total_frames: usize,
    pub total_tracks: usize,
    pub ghost_tracks: usize,
    pub matched: usize,
    pub error_sum_squared: f64,
    pub max_error: f64,
    pub control_samples: usize,
    pub lateral_sum_squared: f64,
    pub max_lateral_error: f64,
}

impl GlobalMetrics {
    pub fn position_rmse(&self) -> f64 {
        if self.matched > 0 {
            (self.error_sum_squared / self.matched as f64).sqrt()
        } else {
            0.0
        }
    }

    /// Fraction of reported tracks that matched no actor.
    pub fn ghost_rate(&self) -> f64 {
        if self.total_tracks > 0 {
            self.ghost_tracks as f64 / self.total_tracks as f64
        } else {
            0.0
        }
    }

    pub fn lateral_rmse(&self) -> f64 {
        if self.control_samples > 0 {
            (self.lateral_sum_squared / self.control_samples as f64).sqrt()
        } else {
            0.0
        }
    }
}

// =============================================================================
// VALIDATION SESSION
// =============================================================================

/// Collects ground truth, tracks and control errors over a run.
#[derive(Debug, Clone)]
pub struct ValidationSession {
    per_actor: BTreeMap<u32, ActorMetrics>,
    global: GlobalMetrics,
    /// Tracks further than this from every actor are ghosts (m)
    association_threshold: f64,
}

impl ValidationSession {
    pub fn new() -> Self {
        Self::with_threshold(2.0)
    }

    pub fn with_threshold(threshold_meters: f64) -> Self {
        Self {
            per_actor: BTreeMap::new(),
            global: GlobalMetrics::default(),
            association_threshold: threshold_meters,
        }
    }

    /// Score one frame. Each actor is matched to its nearest track within
    /// the threshold; a track may serve at most one actor.
    pub fn record_frame(&mut self, truth: &[GroundTruth], tracks: &[TrackedObject]) {
        self.global.total_frames += 1;
        self.global.total_tracks += tracks.len();

        let mut pairs: Vec<(f64, usize, usize)> = Vec::new();
        for (a, actor) in truth.iter().enumerate() {
            for (t, track) in tracks.iter().enumerate() {
                let error = (track.position - actor.position).norm();
                if error <= self.association_threshold {
                    pairs.push((error, a, t));
                }
            }
        }
        pairs.sort_by(|x, y| x.0.total_cmp(&y.0));

        let mut actor_used = vec![false; truth.len()];
        let mut track_used = vec![false; tracks.len()];
        for actor in truth {
            self.per_actor.entry(actor.actor_id).or_default().frames += 1;
        }
        for (error, a, t) in pairs {
            if actor_used[a] || track_used[t] {
                continue;
            }
            actor_used[a] = true;
            track_used[t] = true;

            let metrics = self.per_actor.entry(truth[a].actor_id).or_default();
            metrics.matched_frames += 1;
            metrics.error_sum_squared += error * error;
            metrics.max_error = metrics.max_error.max(error);
            let id = tracks[t].id;
            if metrics.last_track.is_some_and(|last| last != id) {
                metrics.id_switches += 1;
            }
            metrics.last_track = Some(id);

            self.global.matched += 1;
            self.global.error_sum_squared += error * error;
            self.global.max_error = self.global.max_error.max(error);
        }
        self.global.ghost_tracks += track_used.iter().filter(|used| !**used).count();
    }

    pub fn record_control(&mut self, error: &TrackingError) {
        if !error.lateral.is_finite() {
            return;
        }
        self.global.control_samples += 1;
        self.global.lateral_sum_squared += error.lateral * error.lateral;
        self.global.max_lateral_error = self.global.max_lateral_error.max(error.lateral.abs());
    }

    pub fn generate_report(&self) -> ValidationReport {
        let id_switches = self.per_actor.values().map(|m| m.id_switches).sum();
        let (frames, matched) = self
            .per_actor
            .values()
            .fold((0, 0), |(f, m), a| (f + a.frames, m + a.matched_frames));
        ValidationReport {
            global: self.global.clone(),
            per_actor: self.per_actor.clone(),
            association_threshold: self.association_threshold,
            coverage: if frames > 0 { matched as f64 / frames as f64 } else { 0.0 },
            id_switches,
        }
    }
}

impl Default for ValidationSession {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// VALIDATION REPORT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub global: GlobalMetrics,
    pub per_actor: BTreeMap<u32, ActorMetrics>,
    pub association_threshold: f64,
    /// Matched actor-frames over all actor-frames
    pub coverage: f64,
    pub id_switches: usize,
}

impl ValidationReport {
    /// Print formatted report to console
    pub fn print(&self) {
        println!();
        println!("╔══════════════════════════════════════════════════════════════╗");
        println!("║                 PILOT VALIDATION REPORT                      ║");
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║ Frames:                {:>10}                            ║", self.global.total_frames);
        println!("║ Actors:                {:>10}                            ║", self.per_actor.len());
        println!("║ Track Coverage:        {:>10.1}%                           ║", self.coverage * 100.0);
        println!("║ Ghost Rate:            {:>10.1}%                           ║", self.global.ghost_rate() * 100.0);
        println!("║ ID Switches:           {:>10}                            ║", self.id_switches);
        println!("║ Position RMSE:         {:>10.3} m                          ║", self.global.position_rmse());
        println!("║ Max Position Error:    {:>10.3} m                          ║", self.global.max_error);
        println!("║ Lateral RMSE:          {:>10.3} m                          ║", self.global.lateral_rmse());
        println!("║ Max Lateral Error:     {:>10.3} m                          ║", self.global.max_lateral_error);
        println!("╚══════════════════════════════════════════════════════════════╝");

        if !self.per_actor.is_empty() {
            println!("  Actor    Frames    Coverage    RMSE (m)    Switches");
            for (actor_id, metrics) in &self.per_actor {
                println!(
                    "  {:>5}    {:>6}    {:>7.1}%    {:>8.3}    {:>8}",
                    actor_id,
                    metrics.frames,
                    metrics.coverage() * 100.0,
                    metrics.rmse(),
                    metrics.id_switches
                );
            }
        }
    }

    /// Check if validation passes acceptance criteria
    pub fn passes_criteria(&self, max_rmse: f64, min_coverage: f64, max_ghost_rate: f64) -> bool {
        self.global.position_rmse() <= max_rmse
            && self.coverage >= min_coverage
            && self.global.ghost_rate() <= max_ghost_rate
    }
}

// =============================================================================
// TESTS
// =============================================================================
