//! Sampling-based planners: RRT and RRT*.
//!
//! Both grow a tree from the start by steering toward random samples (with
//! a goal bias). RRT returns on the first connection to the goal. RRT*
//! additionally picks the cheapest parent among nearby nodes and rewires
//! neighbors through each new node, then spends the whole iteration budget
//! and returns the cheapest goal connection found. Because rewiring only
//! lowers costs, a larger budget never yields a more expensive path.
//!
//! Sampling uses a seeded ChaCha8 generator, so a given seed always
//! produces the same tree.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use pilot_env::Deadline;

use super::grid::OccupancyGrid;
use super::search::SearchFailure;

#[derive(Debug, Clone)]
struct TreeNode {
    x: f64,
    y: f64,
    parent: Option<usize>,
    cost: f64,
    children: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct TreeResult {
    pub path: Vec<(f64, f64)>,
    pub cost: f64,
    pub iterations: usize,
    pub tree_size: usize,
}

pub struct RrtPlanner<'a> {
    grid: &'a OccupancyGrid,
    step: f64,
    goal_bias: f64,
    rewire_radius: f64,
    goal_tolerance: f64,
    rng: ChaCha8Rng,
    nodes: Vec<TreeNode>,
}

fn dist(a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.0 - b.0).hypot(a.1 - b.1)
}

impl<'a> RrtPlanner<'a> {
    pub fn new(
        grid: &'a OccupancyGrid,
        step: f64,
        goal_bias: f64,
        rewire_radius: f64,
        goal_tolerance: f64,
        seed: u64,
    ) -> Self {
        Self {
            grid,
            step,
            goal_bias,
            rewire_radius,
            goal_tolerance,
            rng: ChaCha8Rng::seed_from_u64(seed),
            nodes: Vec::new(),
        }
    }

    fn point(&self, index: usize) -> (f64, f64) {
        (self.nodes[index].x, self.nodes[index].y)
    }

    fn sample(&mut self, goal: (f64, f64)) -> (f64, f64) {
        if self.rng.gen::<f64>() < self.goal_bias {
            return goal;
        }
        let (min_x, min_y, max_x, max_y) = self.grid.bounds();
        (self.rng.gen_range(min_x..=max_x), self.rng.gen_range(min_y..=max_y))
    }

    fn nearest(&self, p: (f64, f64)) -> usize {
        let mut best = (0, f64::INFINITY);
        for i in 0..self.nodes.len() {
            let d = dist(self.point(i), p);
            if d < best.1 {
                best = (i, d);
            }
        }
        best.0
    }

    fn steer(&self, from: (f64, f64), toward: (f64, f64)) -> (f64, f64) {
        let d = dist(from, toward);
        if d <= self.step {
            return toward;
        }
        let t = self.step / d;
        (from.0 + t * (toward.0 - from.0), from.1 + t * (toward.1 - from.1))
    }

    fn add_node(&mut self, p: (f64, f64), parent: usize, cost: f64) -> usize {
        let index = self.nodes.len();
        self.nodes.push(TreeNode {
            x: p.0,
            y: p.1,
            parent: Some(parent),
            cost,
            children: Vec::new(),
        });
        self.nodes[parent].children.push(index);
        index
    }

    /// Re-parent `node` under `new_parent` and push the cost change down
    /// its subtree.
    fn reparent(&mut self, node: usize, new_parent: usize, new_cost: f64) {
        if let Some(old_parent) = self.nodes[node].parent {
            self.nodes[old_parent].children.retain(|&c| c != node);
        }
        self.nodes[node].parent = Some(new_parent);
        self.nodes[new_parent].children.push(node);

        let delta = new_cost - self.nodes[node].cost;
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            self.nodes[current].cost += delta;
            stack.extend(self.nodes[current].children.iter().copied());
        }
    }

    fn path_to(&self, index: usize, goal: (f64, f64)) -> Vec<(f64, f64)> {
        let mut path = Vec::new();
        if dist(self.point(index), goal) > 1e-9 {
            path.push(goal);
        }
        let mut cursor = Some(index);
        while let Some(i) = cursor {
            path.push(self.point(i));
            cursor = self.nodes[i].parent;
        }
        path.reverse();
        path
    }

    /// Grow the tree. `optimize` selects RRT* behaviour.
    pub fn plan(
        &mut self,
        start: (f64, f64),
        goal: (f64, f64),
        optimize: bool,
        max_iterations: usize,
        deadline: &Deadline<'_>,
    ) -> Result<TreeResult, SearchFailure> {
        self.nodes.clear();
        self.nodes.push(TreeNode {
            x: start.0,
            y: start.1,
            parent: None,
            cost: 0.0,
            children: Vec::new(),
        });

        // Trivial case: start already connects to the goal
        if dist(start, goal) <= self.goal_tolerance {
            return Ok(TreeResult {
                path: vec![start, goal],
                cost: dist(start, goal),
                iterations: 0,
                tree_size: 1,
            });
        }

        let mut goal_parents: Vec<usize> = Vec::new();
        let mut iterations = 0;

        while iterations < max_iterations {
            if deadline.expired() {
                if optimize && !goal_parents.is_empty() {
                    break;
                }
                return Err(SearchFailure::DeadlineExceeded { iterations });
            }
            iterations += 1;

            let sample = self.sample(goal);
            let nearest = self.nearest(sample);
            let new_point = self.steer(self.point(nearest), sample);
            if dist(new_point, self.point(nearest)) < 1e-9
                || !self.grid.segment_free(self.point(nearest), new_point)
            {
                continue;
            }

            let new_index = if optimize {
                self.insert_optimal(nearest, new_point)
            } else {
                let cost = self.nodes[nearest].cost + dist(self.point(nearest), new_point);
                self.add_node(new_point, nearest, cost)
            };

            let to_goal = dist(new_point, goal);
            if to_goal <= self.step && self.grid.segment_free(new_point, goal) {
                if !optimize {
                    return Ok(TreeResult {
                        path: self.path_to(new_index, goal),
                        cost: self.nodes[new_index].cost + to_goal,
                        iterations,
                        tree_size: self.nodes.len(),
                    });
                }
                goal_parents.push(new_index);
            }
        }

        let best = goal_parents
            .iter()
            .map(|&i| (i, self.nodes[i].cost + dist(self.point(i), goal)))
            .min_by(|a, b| a.1.total_cmp(&b.1));

        match best {
            Some((index, cost)) => Ok(TreeResult {
                path: self.path_to(index, goal),
                cost,
                iterations,
                tree_size: self.nodes.len(),
            }),
            None => Err(SearchFailure::Exhausted { iterations }),
        }
    }

    /// Choose the cheapest collision-free parent near `p`, insert, and
    /// rewire neighbors through the new node.
    fn insert_optimal(&mut self, nearest: usize, p: (f64, f64)) -> usize {
        let near: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| dist(self.point(i), p) <= self.rewire_radius)
            .collect();

        let mut parent = nearest;
        let mut cost = self.nodes[nearest].cost + dist(self.point(nearest), p);
        for &candidate in &near {
            let via = self.nodes[candidate].cost + dist(self.point(candidate), p);
            if via < cost && self.grid.segment_free(self.point(candidate), p) {
                parent = candidate;
                cost = via;
            }
        }

        let new_index = self.add_node(p, parent, cost);

        for &neighbor in &near {
            if neighbor == parent {
                continue;
            }
            let via = cost + dist(p, self.point(neighbor));
            if via + 1e-12 < self.nodes[neighbor].cost
                && self.grid.segment_free(p, self.point(neighbor))
            {
                self.reparent(neighbor, new_index, via);
            }
        }
        new_index
    }
}
