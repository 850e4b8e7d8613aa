// rust/kmeans-core/src/coordinator/mod.rs

//! Coordinator side of the clustering run.
//!
//! This module provides:
//!
//! - Worker registration and liveness tracking
//! - Redundant distribution of point groups
//! - Idempotent aggregation of partial contributions
//! - The phase state machine driving each iteration

mod aggregator;
mod distributor;
mod phase;
mod registry;

pub use aggregator::{ApplyOutcome, CentroidAggregator};
pub use distributor::{AdvanceOutcome, DistributorStats, PendingTransmission, TaskDistributor};
pub use phase::{CoordinatorStats, PhaseCoordinator, PhaseKind, RunSummary};
pub use registry::{WorkerRecord, WorkerRegistry, WorkerStatus};
