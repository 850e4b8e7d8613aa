// rust/kmeans-core/src/coordinator/distributor.rs

//! Turns the point source into redundantly pushed PointGroups.

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::codec;
use crate::error::{ClusterError, Result};
use crate::model::PointGroup;
use crate::source::{Batch, PointSource};
use crate::transport::{SendOutcome, WorkChannel};

/// The group currently being pushed.
#[derive(Debug, Clone)]
pub struct PendingTransmission {
    pub group: PointGroup,
    frame: Bytes,
    pub redundancy_remaining: u32,
}

/// Result of one [`TaskDistributor::advance`] step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// One copy of the group was pushed.
    Pushed { group_id: String, remaining: u32 },
    /// Nobody could take the group. The same copy is retried next time.
    Backpressure,
    /// The group could not be encoded and was discarded.
    Dropped { group_id: String },
    /// The source has no more points for this iteration.
    Exhausted,
    /// The work channel is closed.
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DistributorStats {
    pub groups_created: u64,
    pub pushes: u64,
    pub backpressure: u64,
    pub dropped_groups: u64,
    /// Points in groups that were pushed the full number of times.
    pub points_distributed: u64,
}

pub struct TaskDistributor {
    group_size: usize,
    redundancy: u32,
    max_frame_bytes: usize,
    iteration: u64,
    next_group_id: u64,
    pending: Option<PendingTransmission>,
    exhausted: bool,
    stats: DistributorStats,
}

impl TaskDistributor {
    pub fn new(group_size: usize, redundancy: u32, max_frame_bytes: usize) -> Result<Self> {
        let mut distributor = Self {
            group_size: 1,
            redundancy: 1,
            max_frame_bytes,
            iteration: 0,
            next_group_id: 0,
            pending: None,
            exhausted: false,
            stats: DistributorStats::default(),
        };
        distributor.configure(group_size, redundancy)?;
        Ok(distributor)
    }

    /// Change the group size and redundancy for groups created from now on.
    pub fn configure(&mut self, group_size: usize, redundancy: u32) -> Result<()> {
        if group_size == 0 {
            return Err(ClusterError::config("group_size must be greater than 0"));
        }
        if redundancy == 0 {
            return Err(ClusterError::config("redundancy must be at least 1"));
        }
        self.group_size = group_size;
        self.redundancy = redundancy;
        Ok(())
    }

    /// Start distributing a new iteration. The source must already be rewound.
    ///
    /// Group ids keep increasing across iterations.
    pub fn begin_iteration(&mut self, iteration: u64) {
        if let Some(pending) = self.pending.take() {
            warn!(
                group_id = %pending.group.id,
                remaining = pending.redundancy_remaining,
                "Discarding unfinished group"
            );
        }
        self.iteration = iteration;
        self.exhausted = false;
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn pending(&self) -> Option<&PendingTransmission> {
        self.pending.as_ref()
    }

    pub fn stats(&self) -> DistributorStats {
        self.stats
    }

    /// Push one copy of the current group, creating the next group first if
    /// none is pending.
    pub fn advance(
        &mut self,
        source: &mut dyn PointSource,
        work: &mut dyn WorkChannel,
    ) -> Result<AdvanceOutcome> {
        if self.exhausted {
            return Ok(AdvanceOutcome::Exhausted);
        }

        let mut pending = match self.pending.take() {
            Some(pending) => pending,
            None => match self.next_group(source)? {
                NextGroup::Ready(pending) => pending,
                NextGroup::Dropped(group_id) => return Ok(AdvanceOutcome::Dropped { group_id }),
                NextGroup::Exhausted => return Ok(AdvanceOutcome::Exhausted),
            },
        };

        match work.try_push(pending.frame.clone()) {
            SendOutcome::Sent => {
                self.stats.pushes += 1;
                pending.redundancy_remaining -= 1;
                let outcome = AdvanceOutcome::Pushed {
                    group_id: pending.group.id.clone(),
                    remaining: pending.redundancy_remaining,
                };
                if pending.redundancy_remaining == 0 {
                    self.stats.points_distributed += pending.group.len() as u64;
                    debug!(group_id = %pending.group.id, "Group fully pushed");
                } else {
                    self.pending = Some(pending);
                }
                Ok(outcome)
            }
            SendOutcome::Backpressure => {
                self.stats.backpressure += 1;
                self.pending = Some(pending);
                Ok(AdvanceOutcome::Backpressure)
            }
            SendOutcome::Closed => {
                self.pending = Some(pending);
                Ok(AdvanceOutcome::Closed)
            }
        }
    }

    fn next_group(&mut self, source: &mut dyn PointSource) -> Result<NextGroup> {
        let points = match source.next_batch(self.group_size)? {
            Batch::Points(points) if !points.is_empty() => points,
            _ => {
                self.exhausted = true;
                info!(iteration = self.iteration, "Point source exhausted");
                return Ok(NextGroup::Exhausted);
            }
        };

        let id = self.next_group_id.to_string();
        self.next_group_id += 1;
        self.stats.groups_created += 1;
        let group = PointGroup::new(id, self.iteration, points);

        match codec::encode(&group, self.max_frame_bytes) {
            Ok(frame) => Ok(NextGroup::Ready(PendingTransmission {
                group,
                frame,
                redundancy_remaining: self.redundancy,
            })),
            Err(e) => {
                self.stats.dropped_groups += 1;
                warn!(
                    group_id = %group.id,
                    points = group.len(),
                    error = %e,
                    "Dropping group that cannot be encoded"
                );
                Ok(NextGroup::Dropped(group.id))
            }
        }
    }
}

enum NextGroup {
    Ready(PendingTransmission),
    Dropped(String),
    Exhausted,
}
