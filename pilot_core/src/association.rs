//! Detection-to-track association.
//!
//! Association runs once per sensor channel: a track can absorb at most one
//! detection from a given channel per cycle, and a detection feeds at most
//! one track. Pairs farther apart than the gate never match.
//!
//! Two strategies sit behind [`AssociationStrategy`]:
//! - [`GreedyNearestNeighbor`]: each detection, in input order, takes the
//!   closest still-unmatched track inside the gate.
//! - [`HungarianAssociation`]: globally optimal assignment (Kuhn-Munkres)
//!   minimizing total distance over gated pairs.

use nalgebra::Vector3;
use std::fmt;

use crate::config::AssociationMethod;

/// Result of one association pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Assignment {
    /// (track index, detection index)
    pub pairs: Vec<(usize, usize)>,
    pub unmatched_tracks: Vec<usize>,
    pub unmatched_detections: Vec<usize>,
}

impl Assignment {
    fn from_matches(track_match: &[Option<usize>], n_detections: usize) -> Self {
        let mut detection_used = vec![false; n_detections];
        let mut pairs = Vec::new();
        let mut unmatched_tracks = Vec::new();

        for (ti, matched) in track_match.iter().enumerate() {
            match matched {
                Some(di) => {
                    pairs.push((ti, *di));
                    detection_used[*di] = true;
                }
                None => unmatched_tracks.push(ti),
            }
        }
        pairs.sort_unstable_by_key(|&(_, di)| di);

        let unmatched_detections = (0..n_detections).filter(|&d| !detection_used[d]).collect();
        Self {
            pairs,
            unmatched_tracks,
            unmatched_detections,
        }
    }
}

/// Pluggable assignment policy.
pub trait AssociationStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Match predicted track positions against detection positions.
    fn associate(
        &self,
        tracks: &[Vector3<f64>],
        detections: &[Vector3<f64>],
        max_distance: f64,
    ) -> Assignment;
}

/// Build the strategy selected in configuration.
pub fn strategy_for(method: AssociationMethod) -> Box<dyn AssociationStrategy> {
    match method {
        AssociationMethod::Greedy => Box::new(GreedyNearestNeighbor),
        AssociationMethod::Hungarian => Box::new(HungarianAssociation),
    }
}

fn gated_distance(a: &Vector3<f64>, b: &Vector3<f64>, max_distance: f64) -> Option<f64> {
    let d = (a - b).norm();
    (d <= max_distance).then_some(d)
}

// ---------------------------------------------------------------------------
// Greedy nearest neighbor
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct GreedyNearestNeighbor;

impl AssociationStrategy for GreedyNearestNeighbor {
    fn name(&self) -> &'static str {
        "greedy"
    }

    fn associate(
        &self,
        tracks: &[Vector3<f64>],
        detections: &[Vector3<f64>],
        max_distance: f64,
    ) -> Assignment {
        let mut track_match: Vec<Option<usize>> = vec![None; tracks.len()];

        for (di, det) in detections.iter().enumerate() {
            let mut best: Option<(usize, f64)> = None;
            for (ti, track) in tracks.iter().enumerate() {
                if track_match[ti].is_some() {
                    continue;
                }
                if let Some(d) = gated_distance(track, det, max_distance) {
                    // Strict comparison keeps the lowest index on ties
                    if best.map_or(true, |(_, bd)| d < bd) {
                        best = Some((ti, d));
                    }
                }
            }
            if let Some((ti, _)) = best {
                track_match[ti] = Some(di);
            }
        }

        Assignment::from_matches(&track_match, detections.len())
    }
}

// ---------------------------------------------------------------------------
// Hungarian (Kuhn-Munkres), O(n³)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct HungarianAssociation;

impl AssociationStrategy for HungarianAssociation {
    fn name(&self) -> &'static str {
        "hungarian"
    }

    fn associate(
        &self,
        tracks: &[Vector3<f64>],
        detections: &[Vector3<f64>],
        max_distance: f64,
    ) -> Assignment {
        let nt = tracks.len();
        let nd = detections.len();
        if nt == 0 || nd == 0 {
            return Assignment::from_matches(&vec![None; nt], nd);
        }

        // Gated pairs cost more than any combination of real pairs, so the
        // solver maximizes the number of feasible matches first.
        let n = nt.max(nd);
        let forbidden = (max_distance.max(1.0)) * (n as f64 + 1.0) * 1e3;
        let mut cost = vec![0.0; n * n];
        for (ti, track) in tracks.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                cost[ti * n + di] = gated_distance(track, det, max_distance).unwrap_or(forbidden);
            }
        }

        let row_to_col = solve_square(&cost, n);

        let track_match: Vec<Option<usize>> = (0..nt)
            .map(|ti| {
                let di = row_to_col[ti];
                (di < nd && cost[ti * n + di] < forbidden).then_some(di)
            })
            .collect();

        Assignment::from_matches(&track_match, nd)
    }
}

/// Minimum-cost perfect matching on a square row-major matrix.
/// Returns `row_to_col[row]`.
fn solve_square(cost: &[f64], n: usize) -> Vec<usize> {
    // Row and column potentials, 1-indexed with a sentinel at 0
    let mut row_pot = vec![0.0_f64; n + 1];
    let mut col_pot = vec![0.0_f64; n + 1];
    // col_owner[j] = row currently assigned to column j (0 = none)
    let mut col_owner = vec![0usize; n + 1];
    let mut prev_col = vec![0usize; n + 1];

    for row in 1..=n {
        col_owner[0] = row;
        let mut col = 0usize;
        let mut slack = vec![f64::INFINITY; n + 1];
        let mut visited = vec![false; n + 1];

        loop {
            visited[col] = true;
            let r = col_owner[col];
            let mut delta = f64::INFINITY;
            let mut next_col = 0usize;

            for j in 1..=n {
                if visited[j] {
                    continue;
                }
                let reduced = cost[(r - 1) * n + (j - 1)] - row_pot[r] - col_pot[j];
                if reduced < slack[j] {
                    slack[j] = reduced;
                    prev_col[j] = col;
                }
                if slack[j] < delta {
                    delta = slack[j];
                    next_col = j;
                }
            }

            for j in 0..=n {
                if visited[j] {
                    row_pot[col_owner[j]] += delta;
                    col_pot[j] -= delta;
                } else {
                    slack[j] -= delta;
                }
            }

            col = next_col;
            if col_owner[col] == 0 {
                break;
            }
        }

        // Flip the augmenting path
        while col != 0 {
            let back = prev_col[col];
            col_owner[col] = col_owner[back];
            col = back;
        }
    }

    let mut row_to_col = vec![0usize; n];
    for j in 1..=n {
        if col_owner[j] != 0 {
            row_to_col[col_owner[j] - 1] = j - 1;
        }
    }
    row_to_col
}
