// rust/kmeans-core/src/worker/mod.rs

//! Worker side: joins a coordinator, assigns points to the nearest centroid
//! and answers collection requests.

mod session;

pub use session::WorkerSession;
