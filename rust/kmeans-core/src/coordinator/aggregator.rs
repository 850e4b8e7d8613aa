// rust/kmeans-core/src/coordinator/aggregator.rs

//! Idempotent accumulation of partial contributions for one iteration.

use std::collections::HashSet;

use crate::kmeans::{recompute, ClusterSum};
use crate::model::{CentroidSet, PartialContribution, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Already applied for this (worker, iteration, centroid).
    Duplicate,
    WrongIteration,
    UnknownCentroid,
}

#[derive(Debug, Clone)]
pub struct CentroidAggregator {
    iteration: u64,
    sums: Vec<ClusterSum>,
    seen: HashSet<(WorkerId, u64, usize)>,
    responded: HashSet<WorkerId>,
    applied: u64,
}

impl CentroidAggregator {
    pub fn new(iteration: u64, k: usize) -> Self {
        Self {
            iteration,
            sums: vec![ClusterSum::default(); k],
            seen: HashSet::new(),
            responded: HashSet::new(),
            applied: 0,
        }
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn apply(&mut self, contribution: &PartialContribution) -> ApplyOutcome {
        if contribution.iteration != self.iteration {
            return ApplyOutcome::WrongIteration;
        }
        let Some(sum) = self.sums.get_mut(contribution.centroid_index) else {
            return ApplyOutcome::UnknownCentroid;
        };
        if !self.seen.insert(contribution.dedup_key()) {
            return ApplyOutcome::Duplicate;
        }
        sum.add_contribution(contribution);
        self.applied += 1;
        ApplyOutcome::Applied
    }

    /// Record that `worker` delivered its contribution set. Returns false if
    /// it had already responded.
    pub fn mark_responded(&mut self, worker: WorkerId) -> bool {
        self.responded.insert(worker)
    }

    pub fn has_responded(&self, worker: WorkerId) -> bool {
        self.responded.contains(&worker)
    }

    /// Number of contributions applied so far.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// The next centroid set. Clusters nobody contributed to keep their
    /// previous position.
    pub fn finish(&self, previous: &CentroidSet) -> CentroidSet {
        recompute(previous, &self.sums)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Point;

    fn contribution(worker_id: WorkerId, centroid_index: usize, sum: (f64, f64), count: u64) -> PartialContribution {
        PartialContribution {
            worker_id,
            iteration: 2,
            centroid_index,
            sum_x: sum.0,
            sum_y: sum.1,
            count,
        }
    }

    #[test]
    fn test_duplicate_contributions_are_idempotent() {
        let previous = CentroidSet::from_points(2, &[Point::new(0.0, 0.0), Point::new(9.0, 9.0)]);
        let c = contribution(1, 0, (4.0, 6.0), 2);

        let mut once = CentroidAggregator::new(2, 2);
        assert_eq!(once.apply(&c), ApplyOutcome::Applied);

        let mut twice = CentroidAggregator::new(2, 2);
        assert_eq!(twice.apply(&c), ApplyOutcome::Applied);
        assert_eq!(twice.apply(&c), ApplyOutcome::Duplicate);

        assert_eq!(once.finish(&previous), twice.finish(&previous));
        assert_eq!(twice.applied(), 1);
    }

    #[test]
    fn test_weighted_means_and_empty_cluster() {
        let previous = CentroidSet::from_points(
            2,
            &[Point::new(0.0, 0.0), Point::new(5.0, 5.0), Point::new(-3.0, 7.0)],
        );
        let mut aggregator = CentroidAggregator::new(2, 3);
        aggregator.apply(&contribution(0, 0, (3.0, 3.0), 3));
        aggregator.apply(&contribution(1, 0, (1.0, 5.0), 1));
        aggregator.apply(&contribution(1, 1, (20.0, 10.0), 2));

        let next = aggregator.finish(&previous);
        assert_eq!(next.iteration, 3);
        assert_eq!(next.centroids[0].position, Point::new(1.0, 2.0));
        assert_eq!(next.centroids[1].position, Point::new(10.0, 5.0));
        // No contributions for index 2
        assert_eq!(next.centroids[2].position, Point::new(-3.0, 7.0));
    }

    #[test]
    fn test_rejects_foreign_contributions() {
        let mut aggregator = CentroidAggregator::new(2, 2);
        let mut stale = contribution(0, 0, (1.0, 1.0), 1);
        stale.iteration = 1;
        assert_eq!(aggregator.apply(&stale), ApplyOutcome::WrongIteration);
        assert_eq!(
            aggregator.apply(&contribution(0, 5, (1.0, 1.0), 1)),
            ApplyOutcome::UnknownCentroid
        );
        assert_eq!(aggregator.applied(), 0);
    }

    #[test]
    fn test_mark_responded() {
        let mut aggregator = CentroidAggregator::new(0, 1);
        assert!(!aggregator.has_responded(3));
        assert!(aggregator.mark_responded(3));
        assert!(!aggregator.mark_responded(3));
        assert!(aggregator.has_responded(3));
    }
}
