//! Inflated occupancy grid shared by the search and sampling planners.

use super::{Obstacle, PlanningError};
use crate::types::Pose2D;

/// Axis-aligned boolean grid covering start, goal and a padding band.
///
/// A cell is occupied when its center lies within any obstacle's radius
/// plus the inflation distance. Cells outside the grid count as occupied.
#[derive(Debug, Clone)]
pub struct OccupancyGrid {
    origin_x: f64,
    origin_y: f64,
    resolution: f64,
    width: usize,
    height: usize,
    cells: Vec<bool>,
}

impl OccupancyGrid {
    /// Grid spanning the start/goal bounding box grown by `padding`, with
    /// every obstacle inflated by `inflation`. Fails when the grid would
    /// need more than `max_cells` cells.
    pub fn build(
        start: &Pose2D,
        goal: &Pose2D,
        obstacles: &[Obstacle],
        resolution: f64,
        padding: f64,
        inflation: f64,
        max_cells: usize,
    ) -> Result<Self, PlanningError> {
        let origin_x = start.x.min(goal.x) - padding;
        let origin_y = start.y.min(goal.y) - padding;
        let max_x = start.x.max(goal.x) + padding;
        let max_y = start.y.max(goal.y) + padding;

        let width = ((max_x - origin_x) / resolution).ceil() + 1.0;
        let height = ((max_y - origin_y) / resolution).ceil() + 1.0;
        let too_large = || {
            PlanningError::InvalidRequest(format!(
                "start and goal span {width}x{height} grid cells, more than the {max_cells} allowed"
            ))
        };
        // NaN and infinite extents fail this comparison too
        if !(width * height <= max_cells as f64) {
            return Err(too_large());
        }
        let (width, height) = (width as usize, height as usize);
        let cell_count = width.checked_mul(height).filter(|&n| n <= max_cells).ok_or_else(too_large)?;

        let mut grid = Self {
            origin_x,
            origin_y,
            resolution,
            width,
            height,
            cells: vec![false; cell_count],
        };
        for obstacle in obstacles {
            grid.mark(obstacle, inflation);
        }
        Ok(grid)
    }

    fn mark(&mut self, obstacle: &Obstacle, inflation: f64) {
        let reach = obstacle.radius + inflation;
        let (i_min, j_min) = self.world_to_cell(obstacle.x - reach, obstacle.y - reach);
        let (i_max, j_max) = self.world_to_cell(obstacle.x + reach, obstacle.y + reach);

        for j in j_min.max(0)..=j_max.min(self.height as i64 - 1) {
            for i in i_min.max(0)..=i_max.min(self.width as i64 - 1) {
                let (cx, cy) = self.cell_center(i, j);
                if (cx - obstacle.x).hypot(cy - obstacle.y) <= reach {
                    self.cells[j as usize * self.width + i as usize] = true;
                }
            }
        }
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// (min_x, min_y, max_x, max_y) of the covered area
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        (
            self.origin_x,
            self.origin_y,
            self.origin_x + (self.width - 1) as f64 * self.resolution,
            self.origin_y + (self.height - 1) as f64 * self.resolution,
        )
    }

    pub fn world_to_cell(&self, x: f64, y: f64) -> (i64, i64) {
        (
            ((x - self.origin_x) / self.resolution).round() as i64,
            ((y - self.origin_y) / self.resolution).round() as i64,
        )
    }

    pub fn cell_center(&self, i: i64, j: i64) -> (f64, f64) {
        (
            self.origin_x + i as f64 * self.resolution,
            self.origin_y + j as f64 * self.resolution,
        )
    }

    pub fn in_bounds(&self, i: i64, j: i64) -> bool {
        i >= 0 && j >= 0 && (i as usize) < self.width && (j as usize) < self.height
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        let (i, j) = self.world_to_cell(x, y);
        self.in_bounds(i, j)
    }

    pub fn is_occupied(&self, i: i64, j: i64) -> bool {
        if !self.in_bounds(i, j) {
            return true;
        }
        self.cells[j as usize * self.width + i as usize]
    }

    pub fn is_free_world(&self, x: f64, y: f64) -> bool {
        let (i, j) = self.world_to_cell(x, y);
        !self.is_occupied(i, j)
    }

    /// Walk the segment at half-cell spacing and check every sample.
    pub fn segment_free(&self, from: (f64, f64), to: (f64, f64)) -> bool {
        let length = (to.0 - from.0).hypot(to.1 - from.1);
        let steps = (length / (0.5 * self.resolution)).ceil().max(1.0) as usize;
        (0..=steps).all(|k| {
            let t = k as f64 / steps as f64;
            self.is_free_world(from.0 + t * (to.0 - from.0), from.1 + t * (to.1 - from.1))
        })
    }

    pub fn occupied_count(&self) -> usize {
        self.cells.iter().filter(|&&c| c).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_with(obstacles: &[Obstacle]) -> OccupancyGrid {
        OccupancyGrid::build(
            &Pose2D::new(0.0, 0.0, 0.0),
            &Pose2D::new(20.0, 0.0, 0.0),
            obstacles,
            0.5,
            5.0,
            1.0,
            100_000,
        )
        .unwrap()
    }

    #[test]
    fn test_grid_covers_padded_box() {
        let grid = grid_with(&[]);
        let (min_x, min_y, max_x, max_y) = grid.bounds();

        assert_eq!(grid.occupied_count(), 0);
        assert!(min_x <= -5.0 && min_y <= -5.0);
        assert!(max_x >= 25.0 && max_y >= 5.0);
        assert!(grid.is_free_world(10.0, 0.0));
        assert!(!grid.is_free_world(100.0, 0.0));
    }

    #[test]
    fn test_obstacle_inflation() {
        let grid = grid_with(&[Obstacle::new(10.0, 0.0, 1.0)]);

        assert!(!grid.is_free_world(10.0, 0.0));
        assert!(!grid.is_free_world(11.9, 0.0));
        assert!(grid.is_free_world(12.6, 0.0));
        assert!(!grid.segment_free((0.0, 0.0), (20.0, 0.0)));
        assert!(grid.segment_free((0.0, 4.0), (20.0, 4.0)));
    }

    #[test]
    fn test_far_goal_is_rejected_not_allocated() {
        let start = Pose2D::new(0.0, 0.0, 0.0);
        let goals = [
            Pose2D::new(1e10, 1e10, 0.0),
            Pose2D::new(f64::MAX, 0.0, 0.0),
            Pose2D::new(5_000.0, 0.0, 0.0),
        ];
        for goal in goals {
            let result = OccupancyGrid::build(&start, &goal, &[], 0.5, 15.0, 1.0, 100_000);
            assert!(matches!(result, Err(PlanningError::InvalidRequest(_))), "goal {goal:?}");
        }
    }

    #[test]
    fn test_cell_cap_is_inclusive() {
        let start = Pose2D::new(0.0, 0.0, 0.0);
        let goal = Pose2D::new(9.0, 0.0, 0.0);
        // 10 x 1 cells at 1 m resolution without padding
        let grid = OccupancyGrid::build(&start, &goal, &[], 1.0, 0.0, 0.0, 10).unwrap();
        assert_eq!(grid.width() * grid.height(), 10);
        assert!(OccupancyGrid::build(&start, &goal, &[], 1.0, 0.0, 0.0, 9).is_err());
    }
}
