// rust/kmeans-core/src/model.rs

//! Value types exchanged between the coordinator and workers.

use serde::{Deserialize, Serialize};

/// Identifier assigned to a worker on a successful join.
pub type WorkerId = u64;

/// A two-dimensional data point.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Squared euclidean distance to `other`.
    pub fn distance_sq(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    pub fn distance(&self, other: &Point) -> f64 {
        self.distance_sq(other).sqrt()
    }
}

/// A task unit: a bounded batch of points for one iteration.
///
/// A group with no points is the "no more work" sentinel and is never put
/// into circulation by the distributor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointGroup {
    /// Unique within an iteration.
    pub id: String,
    pub iteration: u64,
    pub points: Vec<Point>,
}

impl PointGroup {
    pub fn new(id: impl Into<String>, iteration: u64, points: Vec<Point>) -> Self {
        Self {
            id: id.into(),
            iteration,
            points,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// A centroid position tagged with its index and iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub index: usize,
    pub iteration: u64,
    pub position: Point,
}

/// The full set of K centroids for one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentroidSet {
    pub iteration: u64,
    pub centroids: Vec<Centroid>,
}

impl CentroidSet {
    pub fn from_points(iteration: u64, positions: &[Point]) -> Self {
        let centroids = positions
            .iter()
            .enumerate()
            .map(|(index, position)| Centroid {
                index,
                iteration,
                position: *position,
            })
            .collect();
        Self {
            iteration,
            centroids,
        }
    }

    pub fn positions(&self) -> Vec<Point> {
        self.centroids.iter().map(|c| c.position).collect()
    }

    pub fn len(&self) -> usize {
        self.centroids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centroids.is_empty()
    }
}

/// A worker's local aggregate toward one centroid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartialContribution {
    pub worker_id: WorkerId,
    pub iteration: u64,
    pub centroid_index: usize,
    pub sum_x: f64,
    pub sum_y: f64,
    pub count: u64,
}

impl PartialContribution {
    /// Key used to deduplicate redundant deliveries.
    pub fn dedup_key(&self) -> (WorkerId, u64, usize) {
        (self.worker_id, self.iteration, self.centroid_index)
    }
}
