// rust/kmeans-core/src/kmeans.rs

//! The numeric side of K-Means: nearest-centroid assignment on workers and
//! centroid recomputation on the coordinator.

use crate::model::{CentroidSet, PartialContribution, Point, WorkerId};

/// Running sum of the points assigned to one centroid.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClusterSum {
    pub sum_x: f64,
    pub sum_y: f64,
    pub count: u64,
}

impl ClusterSum {
    pub fn add_point(&mut self, point: &Point) {
        self.sum_x += point.x;
        self.sum_y += point.y;
        self.count += 1;
    }

    pub fn add_contribution(&mut self, contribution: &PartialContribution) {
        self.sum_x += contribution.sum_x;
        self.sum_y += contribution.sum_y;
        self.count += contribution.count;
    }

    /// Mean of the accumulated points, `None` for an empty cluster.
    pub fn mean(&self) -> Option<Point> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        Some(Point::new(self.sum_x / n, self.sum_y / n))
    }
}

/// Index of the centroid closest to `point`. Ties go to the lower index.
pub fn nearest(centroids: &[Point], point: &Point) -> Option<usize> {
    centroids
        .iter()
        .enumerate()
        .map(|(i, c)| (i, c.distance_sq(point)))
        .fold(None, |best: Option<(usize, f64)>, (i, d)| match best {
            Some((_, bd)) if bd <= d => best,
            _ => Some((i, d)),
        })
        .map(|(i, _)| i)
}

/// Assign each point to its nearest centroid and add it to `sums`.
///
/// `sums` must have one slot per centroid.
pub fn accumulate(centroids: &[Point], points: &[Point], sums: &mut [ClusterSum]) {
    debug_assert_eq!(centroids.len(), sums.len());
    for point in points {
        if let Some(index) = nearest(centroids, point) {
            sums[index].add_point(point);
        }
    }
}

/// Turn per-centroid sums into contributions, skipping empty clusters.
pub fn to_contributions(
    worker_id: WorkerId,
    iteration: u64,
    sums: &[ClusterSum],
) -> Vec<PartialContribution> {
    sums.iter()
        .enumerate()
        .filter(|(_, s)| s.count > 0)
        .map(|(centroid_index, s)| PartialContribution {
            worker_id,
            iteration,
            centroid_index,
            sum_x: s.sum_x,
            sum_y: s.sum_y,
            count: s.count,
        })
        .collect()
}

/// Compute the next centroid set from the aggregated sums.
///
/// A centroid with no assigned points keeps its previous position.
pub fn recompute(previous: &CentroidSet, sums: &[ClusterSum]) -> CentroidSet {
    let positions: Vec<Point> = previous
        .centroids
        .iter()
        .map(|c| {
            sums.get(c.index)
                .and_then(ClusterSum::mean)
                .unwrap_or(c.position)
        })
        .collect();
    CentroidSet::from_points(previous.iteration + 1, &positions)
}

/// Largest distance any centroid moved between two sets of equal size.
pub fn max_displacement(before: &CentroidSet, after: &CentroidSet) -> f64 {
    before
        .centroids
        .iter()
        .zip(after.centroids.iter())
        .map(|(a, b)| a.position.distance(&b.position))
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest() {
        let centroids = vec![Point::new(0.0, 0.0), Point::new(10.0, 10.0)];
        assert_eq!(nearest(&centroids, &Point::new(1.0, 2.0)), Some(0));
        assert_eq!(nearest(&centroids, &Point::new(9.0, 8.0)), Some(1));
        assert_eq!(nearest(&[], &Point::new(1.0, 1.0)), None);
    }

    #[test]
    fn test_nearest_tie_prefers_lower_index() {
        let centroids = vec![Point::new(-1.0, 0.0), Point::new(1.0, 0.0)];
        assert_eq!(nearest(&centroids, &Point::new(0.0, 0.0)), Some(0));
    }

    #[test]
    fn test_accumulate_and_contributions() {
        let centroids = vec![Point::new(0.0, 0.0), Point::new(10.0, 10.0)];
        let points = vec![
            Point::new(1.0, 1.0),
            Point::new(-1.0, 1.0),
            Point::new(11.0, 9.0),
        ];
        let mut sums = vec![ClusterSum::default(); 2];
        accumulate(&centroids, &points, &mut sums);

        assert_eq!(sums[0].count, 2);
        assert_eq!(sums[0].sum_x, 0.0);
        assert_eq!(sums[0].sum_y, 2.0);
        assert_eq!(sums[1].count, 1);

        let contributions = to_contributions(4, 2, &sums);
        assert_eq!(contributions.len(), 2);
        assert_eq!(contributions[1].worker_id, 4);
        assert_eq!(contributions[1].iteration, 2);
        assert_eq!(contributions[1].sum_x, 11.0);
    }

    #[test]
    fn test_contributions_skip_empty_clusters() {
        let mut sums = vec![ClusterSum::default(); 3];
        sums[2].add_point(&Point::new(1.0, 1.0));
        let contributions = to_contributions(0, 0, &sums);
        assert_eq!(contributions.len(), 1);
        assert_eq!(contributions[0].centroid_index, 2);
    }

    #[test]
    fn test_recompute_keeps_empty_cluster_position() {
        let previous = CentroidSet::from_points(4, &[Point::new(1.0, 1.0), Point::new(7.0, 7.0)]);
        let mut sums = vec![ClusterSum::default(); 2];
        sums[0].add_point(&Point::new(2.0, 4.0));
        sums[0].add_point(&Point::new(4.0, 2.0));

        let next = recompute(&previous, &sums);
        assert_eq!(next.iteration, 5);
        assert_eq!(next.centroids[0].position, Point::new(3.0, 3.0));
        assert_eq!(next.centroids[1].position, Point::new(7.0, 7.0));
        assert!(next.positions().iter().all(|p| p.x.is_finite() && p.y.is_finite()));
    }

    #[test]
    fn test_max_displacement() {
        let a = CentroidSet::from_points(0, &[Point::new(0.0, 0.0), Point::new(5.0, 5.0)]);
        let b = CentroidSet::from_points(1, &[Point::new(0.0, 1.0), Point::new(8.0, 9.0)]);
        assert_eq!(max_displacement(&a, &b), 5.0);
        assert_eq!(max_displacement(&a, &a), 0.0);
    }
}
