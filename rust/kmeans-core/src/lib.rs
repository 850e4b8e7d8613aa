// rust/kmeans-core/src/lib.rs

//! Distributed K-Means - Core Library
//!
//! This crate provides the coordinator and worker halves of a distributed
//! K-Means run, including configuration, error handling, the wire codec,
//! point sources and the messaging transports that connect them.

pub mod config;
pub mod error;

// Re-export commonly used types for convenience
pub use config::{CoordinatorConfig, WorkerConfig};
pub use error::{ClusterError, Result};

pub mod codec;
pub mod kmeans;
pub mod model;
pub use model::{Centroid, CentroidSet, PartialContribution, Point, PointGroup, WorkerId};

pub mod protocol;
pub mod source;
pub use source::{Batch, CsvPointSource, MemorySource, PointSource};

pub mod transport;
pub use transport::{MemoryHub, TcpTransport, TcpWorkerLink, Transport, WorkerLink};

pub mod coordinator;
pub use coordinator::{PhaseCoordinator, PhaseKind, RunSummary};

pub mod worker;
pub use worker::WorkerSession;
