//! Best-first graph search and the two spaces it runs over.
//!
//! `best_first_search` is plain A*: pop the lowest f = g + h, skip stale
//! entries, expand, relax. `GridSpace` makes it 8-connected grid A*;
//! `HybridSpace` makes it Hybrid-A* over (x, y, heading) with bicycle
//! motion primitives.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::hash::Hash;

use pilot_env::Deadline;

use super::grid::OccupancyGrid;
use crate::types::normalize_angle;

/// Graph the search runs over.
pub trait SearchSpace {
    type Node: Clone;
    type Key: Eq + Hash + Clone;

    /// Nodes with the same key are the same search state.
    fn key(&self, node: &Self::Node) -> Self::Key;

    /// Push (successor, step cost) pairs into `out`.
    fn successors(&self, node: &Self::Node, out: &mut Vec<(Self::Node, f64)>);

    /// Admissible cost-to-go estimate.
    fn heuristic(&self, node: &Self::Node) -> f64;

    fn is_goal(&self, node: &Self::Node) -> bool;
}

#[derive(Debug, Clone)]
pub struct SearchResult<N> {
    pub path: Vec<N>,
    pub cost: f64,
    pub iterations: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchFailure {
    /// Hit the iteration budget
    Exhausted { iterations: usize },
    /// Open set ran dry
    Unreachable { iterations: usize },
    DeadlineExceeded { iterations: usize },
}

#[derive(Debug, Clone, Copy)]
struct OpenEntry {
    f: f64,
    seq: u64,
    index: usize,
}

impl PartialEq for OpenEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OpenEntry {}

impl PartialOrd for OpenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpenEntry {
    // BinaryHeap is a max-heap: lowest f first, then oldest insertion
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .f
            .total_cmp(&self.f)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct SearchNode<N> {
    node: N,
    parent: Option<usize>,
    g: f64,
}

pub fn best_first_search<S: SearchSpace>(
    space: &S,
    start: S::Node,
    max_iterations: usize,
    deadline: &Deadline<'_>,
) -> Result<SearchResult<S::Node>, SearchFailure> {
    let mut arena = vec![SearchNode {
        node: start.clone(),
        parent: None,
        g: 0.0,
    }];
    let mut best_g: HashMap<S::Key, f64> = HashMap::new();
    let mut closed: HashSet<S::Key> = HashSet::new();
    let mut open = BinaryHeap::new();

    best_g.insert(space.key(&start), 0.0);
    open.push(OpenEntry {
        f: space.heuristic(&start),
        seq: 0,
        index: 0,
    });

    let mut seq = 1u64;
    let mut iterations = 0usize;
    let mut successors = Vec::new();

    while let Some(entry) = open.pop() {
        if iterations >= max_iterations {
            return Err(SearchFailure::Exhausted { iterations });
        }
        if deadline.expired() {
            return Err(SearchFailure::DeadlineExceeded { iterations });
        }
        iterations += 1;

        let node = arena[entry.index].node.clone();
        let g = arena[entry.index].g;
        if !closed.insert(space.key(&node)) {
            continue;
        }

        if space.is_goal(&node) {
            return Ok(reconstruct(&arena, entry.index, iterations));
        }

        successors.clear();
        space.successors(&node, &mut successors);
        for (next, step_cost) in successors.drain(..) {
            let next_key = space.key(&next);
            if closed.contains(&next_key) {
                continue;
            }
            let tentative = g + step_cost;
            if best_g.get(&next_key).map_or(true, |&known| tentative < known) {
                best_g.insert(next_key, tentative);
                let f = tentative + space.heuristic(&next);
                arena.push(SearchNode {
                    node: next,
                    parent: Some(entry.index),
                    g: tentative,
                });
                open.push(OpenEntry {
                    f,
                    seq,
                    index: arena.len() - 1,
                });
                seq += 1;
            }
        }
    }

    Err(SearchFailure::Unreachable { iterations })
}

fn reconstruct<N: Clone>(arena: &[SearchNode<N>], goal: usize, iterations: usize) -> SearchResult<N> {
    let mut path = Vec::new();
    let mut cursor = Some(goal);
    while let Some(index) = cursor {
        path.push(arena[index].node.clone());
        cursor = arena[index].parent;
    }
    path.reverse();

    SearchResult {
        path,
        cost: arena[goal].g,
        iterations,
    }
}

// ============================================================================
// GRID A*
// ============================================================================

const NEIGHBORS: [(i64, i64); 8] = [
    (1, 0),
    (-1, 0),
    (0, 1),
    (0, -1),
    (1, 1),
    (1, -1),
    (-1, 1),
    (-1, -1),
];

/// 8-connected grid, diagonal moves may not cut occupied corners.
pub struct GridSpace<'a> {
    pub grid: &'a OccupancyGrid,
    pub goal: (f64, f64),
    pub goal_tolerance: f64,
}

impl SearchSpace for GridSpace<'_> {
    type Node = (i64, i64);
    type Key = (i64, i64);

    fn key(&self, node: &Self::Node) -> Self::Key {
        *node
    }

    fn successors(&self, &(i, j): &Self::Node, out: &mut Vec<(Self::Node, f64)>) {
        let res = self.grid.resolution();
        for (di, dj) in NEIGHBORS {
            let (ni, nj) = (i + di, j + dj);
            if self.grid.is_occupied(ni, nj) {
                continue;
            }
            let diagonal = di != 0 && dj != 0;
            if diagonal && (self.grid.is_occupied(i + di, j) || self.grid.is_occupied(i, j + dj)) {
                continue;
            }
            let step = if diagonal { res * std::f64::consts::SQRT_2 } else { res };
            out.push(((ni, nj), step));
        }
    }

    fn heuristic(&self, &(i, j): &Self::Node) -> f64 {
        let (x, y) = self.grid.cell_center(i, j);
        (x - self.goal.0).hypot(y - self.goal.1)
    }

    fn is_goal(&self, node: &Self::Node) -> bool {
        self.heuristic(node) <= self.goal_tolerance
    }
}

// ============================================================================
// HYBRID A*
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HybridNode {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
}

/// Continuous (x, y, heading) states, discretized for the closed set.
pub struct HybridSpace<'a> {
    pub grid: &'a OccupancyGrid,
    pub goal: (f64, f64),
    pub goal_tolerance: f64,
    pub wheelbase: f64,
    /// Road-wheel angles tried at every expansion
    pub steering_samples: Vec<f64>,
    /// Arc length of one motion primitive (m)
    pub step: f64,
    pub heading_bins: usize,
    /// Extra cost per radian of steering, relative to arc length
    pub steering_penalty: f64,
}

impl HybridSpace<'_> {
    /// Integrate one bicycle-model primitive; `None` if it hits anything.
    fn simulate(&self, from: &HybridNode, steer: f64) -> Option<HybridNode> {
        let substeps = (self.step / (0.5 * self.grid.resolution())).ceil().max(1.0) as usize;
        let ds = self.step / substeps as f64;
        let yaw_rate = steer.tan() / self.wheelbase;

        let mut node = *from;
        for _ in 0..substeps {
            node.heading = normalize_angle(node.heading + ds * yaw_rate);
            node.x += ds * node.heading.cos();
            node.y += ds * node.heading.sin();
            if !self.grid.is_free_world(node.x, node.y) {
                return None;
            }
        }
        Some(node)
    }

    fn heading_bin(&self, heading: f64) -> i64 {
        let bins = self.heading_bins.max(1) as f64;
        let unit = (heading.rem_euclid(2.0 * std::f64::consts::PI)) / (2.0 * std::f64::consts::PI);
        ((unit * bins).floor() as i64).rem_euclid(bins as i64)
    }
}

impl SearchSpace for HybridSpace<'_> {
    type Node = HybridNode;
    type Key = (i64, i64, i64);

    fn key(&self, node: &Self::Node) -> Self::Key {
        let (i, j) = self.grid.world_to_cell(node.x, node.y);
        (i, j, self.heading_bin(node.heading))
    }

    fn successors(&self, node: &Self::Node, out: &mut Vec<(Self::Node, f64)>) {
        for &steer in &self.steering_samples {
            if let Some(next) = self.simulate(node, steer) {
                let cost = self.step * (1.0 + self.steering_penalty * steer.abs());
                out.push((next, cost));
            }
        }

        // Straight shot onto the goal when it is close and roughly ahead
        let dx = self.goal.0 - node.x;
        let dy = self.goal.1 - node.y;
        let distance = dx.hypot(dy);
        if distance > self.goal_tolerance && distance <= 1.5 * self.step {
            let bearing = dy.atan2(dx);
            if normalize_angle(bearing - node.heading).abs() <= std::f64::consts::FRAC_PI_4
                && self.grid.segment_free((node.x, node.y), self.goal)
            {
                out.push((
                    HybridNode {
                        x: self.goal.0,
                        y: self.goal.1,
                        heading: bearing,
                    },
                    distance,
                ));
            }
        }
    }

    fn heuristic(&self, node: &Self::Node) -> f64 {
        (node.x - self.goal.0).hypot(node.y - self.goal.1)
    }

    fn is_goal(&self, node: &Self::Node) -> bool {
        self.heuristic(node) <= self.goal_tolerance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pilot_planning::Obstacle;
    use crate::types::Pose2D;

    fn open_grid(obstacles: &[Obstacle]) -> OccupancyGrid {
        OccupancyGrid::build(
            &Pose2D::new(0.0, 0.0, 0.0),
            &Pose2D::new(10.0, 0.0, 0.0),
            obstacles,
            0.5,
            5.0,
            0.5,
            100_000,
        )
        .unwrap()
    }

    #[test]
    fn test_grid_astar_straight_line_cost() {
        let grid = open_grid(&[]);
        let space = GridSpace {
            grid: &grid,
            goal: (10.0, 0.0),
            goal_tolerance: 0.1,
        };
        let start = grid.world_to_cell(0.0, 0.0);
        let result = best_first_search(&space, start, 10_000, &Deadline::never()).unwrap();

        assert!((result.cost - 10.0).abs() < 1e-9);
        assert_eq!(result.path.first(), Some(&start));
        assert_eq!(result.path.len(), 21);
    }

    #[test]
    fn test_grid_astar_detours_around_obstacle() {
        let grid = open_grid(&[Obstacle::new(5.0, 0.0, 1.0)]);
        let space = GridSpace {
            grid: &grid,
            goal: (10.0, 0.0),
            goal_tolerance: 0.1,
        };
        let start = grid.world_to_cell(0.0, 0.0);
        let result = best_first_search(&space, start, 10_000, &Deadline::never()).unwrap();

        assert!(result.cost > 10.0);
        assert!(result.path.iter().all(|&(i, j)| !grid.is_occupied(i, j)));
    }

    #[test]
    fn test_search_reports_exhaustion() {
        let grid = open_grid(&[]);
        let space = GridSpace {
            grid: &grid,
            goal: (10.0, 0.0),
            goal_tolerance: 0.1,
        };
        let start = grid.world_to_cell(0.0, 0.0);
        let err = best_first_search(&space, start, 3, &Deadline::never()).unwrap_err();

        assert_eq!(err, SearchFailure::Exhausted { iterations: 3 });
    }

    #[test]
    fn test_search_reports_unreachable_goal() {
        // Goal sits inside an obstacle
        let grid = open_grid(&[Obstacle::new(10.0, 0.0, 2.0)]);
        let space = GridSpace {
            grid: &grid,
            goal: (10.0, 0.0),
            goal_tolerance: 0.1,
        };
        let start = grid.world_to_cell(0.0, 0.0);
        let err = best_first_search(&space, start, 1_000_000, &Deadline::never()).unwrap_err();

        assert!(matches!(err, SearchFailure::Unreachable { .. }));
    }

    #[test]
    fn test_hybrid_primitives_respect_curvature() {
        let grid = open_grid(&[]);
        let space = HybridSpace {
            grid: &grid,
            goal: (10.0, 0.0),
            goal_tolerance: 1.0,
            wheelbase: 2.7,
            steering_samples: vec![-0.5, 0.0, 0.5],
            step: 1.5,
            heading_bins: 36,
            steering_penalty: 0.5,
        };
        let start = HybridNode { x: 0.0, y: 0.0, heading: 0.0 };
        let mut out = Vec::new();
        space.successors(&start, &mut out);

        assert_eq!(out.len(), 3);
        let max_turn = 1.5 * 0.5_f64.tan() / 2.7;
        for (node, cost) in &out {
            assert!(node.heading.abs() <= max_turn + 1e-9);
            assert!(*cost >= 1.5);
        }
    }

    #[test]
    fn test_hybrid_search_reaches_goal() {
        let grid = open_grid(&[]);
        let space = HybridSpace {
            grid: &grid,
            goal: (10.0, 0.0),
            goal_tolerance: 1.0,
            wheelbase: 2.7,
            steering_samples: vec![-0.5, -0.25, 0.0, 0.25, 0.5],
            step: 1.5,
            heading_bins: 36,
            steering_penalty: 0.5,
        };
        let start = HybridNode { x: 0.0, y: 0.0, heading: 0.0 };
        let result = best_first_search(&space, start, 20_000, &Deadline::never()).unwrap();
        let last = result.path.last().unwrap();

        assert!((last.x - 10.0).hypot(last.y) <= 1.0);
    }
}
