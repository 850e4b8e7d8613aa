// rust/kmeans-core/src/config.rs

//! Configuration management for the coordinator and workers.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ClusterError, Result};

/// Default upper bound for a single frame on any channel (16 MB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

// Top-level coordinator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Identity used in START/DONE reports. Empty means a random UUID.
    pub uid: String,
    pub network: NetworkConfig,
    pub distribution: DistributionConfig,
    pub collection: CollectionConfig,
    pub convergence: ConvergenceConfig,
}

/// Channel addresses. All three are bound by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Work channel (coordinator pushes PointGroups).
    pub work_address: String,
    /// Control channel (broadcast/unicast commands plus the return path).
    pub control_address: String,
    /// Join/report channel (request/reply).
    pub join_address: String,
    /// Optional upstream that receives this coordinator's START/DONE reports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_address: Option<String>,
    /// Largest frame accepted or produced on any channel.
    pub max_frame_bytes: usize,
}

/// How the dataset is cut into task units and pushed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Points per PointGroup.
    pub group_size: usize,
    /// Delivery attempts per PointGroup.
    pub redundancy: u32,
    /// Frames a single consumer may have queued before pushes back off.
    pub work_backlog: usize,
    /// Upper bound on `advance()` calls in one tick.
    pub max_advances_per_tick: usize,
}

/// Timing of the control loop and centroid collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    // Bounded wait for contributions once REQCENTROIDS is broadcast.
    pub timeout_ms: u64,
    // Silence after which a worker is marked as having missed a response.
    pub worker_timeout_ms: u64,
    // Control loop tick.
    pub tick_ms: u64,
    // Workers required before distribution starts.
    pub min_workers: usize,
}

/// Stopping criteria.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Number of centroids.
    pub k: usize,
    /// Stop once no centroid moves further than this.
    pub threshold: f64,
    /// Hard cap on iterations.
    pub max_iterations: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            work_address: "0.0.0.0:10000".to_string(),
            control_address: "0.0.0.0:10010".to_string(),
            join_address: "0.0.0.0:10001".to_string(),
            report_address: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            group_size: 20,
            redundancy: 5,
            work_backlog: 5,
            max_advances_per_tick: 64,
        }
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            worker_timeout_ms: 15_000,
            tick_ms: 10,
            min_workers: 1,
        }
    }
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            k: 5,
            threshold: 1e-3,
            max_iterations: 50,
        }
    }
}

impl DistributionConfig {
    /// Whether a group may be processed by more than one worker. Workers
    /// skip copies they already saw, but copies that land on different
    /// workers are each counted.
    pub fn has_redundant_copies(&self) -> bool {
        self.redundancy > 1
    }
}

impl CollectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

impl FromStr for CoordinatorConfig {
    type Err = ClusterError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| ClusterError::config_with_source("failed to parse TOML config", e))
    }
}

impl CoordinatorConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClusterError::config_with_source(
                format!("failed to read config file {}", path.display()),
                e,
            )
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Variables are prefixed with `KMC_` and name the section and field:
    // - `KMC_UID` overrides `uid`
    // - `KMC_NETWORK_WORK_ADDRESS` overrides `network.work_address`
    // - `KMC_DISTRIBUTION_REDUNDANCY` overrides `distribution.redundancy`
    // - `KMC_CONVERGENCE_K` overrides `convergence.k`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("KMC_UID") {
            self.uid = val;
        }

        // Network overrides
        if let Ok(val) = std::env::var("KMC_NETWORK_WORK_ADDRESS") {
            self.network.work_address = val;
        }
        if let Ok(val) = std::env::var("KMC_NETWORK_CONTROL_ADDRESS") {
            self.network.control_address = val;
        }
        if let Ok(val) = std::env::var("KMC_NETWORK_JOIN_ADDRESS") {
            self.network.join_address = val;
        }
        if let Ok(val) = std::env::var("KMC_NETWORK_REPORT_ADDRESS") {
            self.network.report_address = Some(val);
        }
        if let Ok(val) = std::env::var("KMC_NETWORK_MAX_FRAME_BYTES") {
            if let Ok(v) = val.parse() {
                self.network.max_frame_bytes = v;
            }
        }

        // Distribution overrides
        if let Ok(val) = std::env::var("KMC_DISTRIBUTION_GROUP_SIZE") {
            if let Ok(v) = val.parse() {
                self.distribution.group_size = v;
            }
        }
        if let Ok(val) = std::env::var("KMC_DISTRIBUTION_REDUNDANCY") {
            if let Ok(v) = val.parse() {
                self.distribution.redundancy = v;
            }
        }
        if let Ok(val) = std::env::var("KMC_DISTRIBUTION_WORK_BACKLOG") {
            if let Ok(v) = val.parse() {
                self.distribution.work_backlog = v;
            }
        }

        // Collection overrides
        if let Ok(val) = std::env::var("KMC_COLLECTION_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.collection.timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("KMC_COLLECTION_WORKER_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.collection.worker_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("KMC_COLLECTION_TICK_MS") {
            if let Ok(v) = val.parse() {
                self.collection.tick_ms = v;
            }
        }
        if let Ok(val) = std::env::var("KMC_COLLECTION_MIN_WORKERS") {
            if let Ok(v) = val.parse() {
                self.collection.min_workers = v;
            }
        }

        // Convergence overrides
        if let Ok(val) = std::env::var("KMC_CONVERGENCE_K") {
            if let Ok(v) = val.parse() {
                self.convergence.k = v;
            }
        }
        if let Ok(val) = std::env::var("KMC_CONVERGENCE_THRESHOLD") {
            if let Ok(v) = val.parse() {
                self.convergence.threshold = v;
            }
        }
        if let Ok(val) = std::env::var("KMC_CONVERGENCE_MAX_ITERATIONS") {
            if let Ok(v) = val.parse() {
                self.convergence.max_iterations = v;
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        for (name, addr) in [
            ("network.work_address", &self.network.work_address),
            ("network.control_address", &self.network.control_address),
            ("network.join_address", &self.network.join_address),
        ] {
            if addr.is_empty() {
                return Err(ClusterError::config(format!("{} must not be empty", name)));
            }
        }
        if self.network.max_frame_bytes == 0 {
            return Err(ClusterError::config(
                "network.max_frame_bytes must be greater than 0",
            ));
        }

        if self.distribution.group_size == 0 {
            return Err(ClusterError::config(
                "distribution.group_size must be greater than 0",
            ));
        }
        if self.distribution.redundancy == 0 {
            return Err(ClusterError::config(
                "distribution.redundancy must be at least 1",
            ));
        }
        if self.distribution.work_backlog == 0 {
            return Err(ClusterError::config(
                "distribution.work_backlog must be greater than 0",
            ));
        }
        if self.distribution.max_advances_per_tick == 0 {
            return Err(ClusterError::config(
                "distribution.max_advances_per_tick must be greater than 0",
            ));
        }

        if self.collection.timeout_ms == 0 {
            return Err(ClusterError::config(
                "collection.timeout_ms must be greater than 0",
            ));
        }
        if self.collection.worker_timeout_ms == 0 {
            return Err(ClusterError::config(
                "collection.worker_timeout_ms must be greater than 0",
            ));
        }
        if self.collection.tick_ms == 0 {
            return Err(ClusterError::config(
                "collection.tick_ms must be greater than 0",
            ));
        }
        if self.collection.min_workers == 0 {
            return Err(ClusterError::config(
                "collection.min_workers must be at least 1",
            ));
        }

        if self.convergence.k == 0 {
            return Err(ClusterError::config("convergence.k must be greater than 0"));
        }
        if self.convergence.threshold.is_nan() || self.convergence.threshold < 0.0 {
            return Err(ClusterError::config(
                "convergence.threshold must be a non-negative number",
            ));
        }
        if self.convergence.max_iterations == 0 {
            return Err(ClusterError::config(
                "convergence.max_iterations must be greater than 0",
            ));
        }

        Ok(())
    }
}

/// Worker process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub join_address: String,
    pub work_address: String,
    pub control_address: String,
    /// Interval between HEARTBEAT messages on the return path.
    pub heartbeat_interval_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            join_address: "127.0.0.1:10001".to_string(),
            work_address: "127.0.0.1:10000".to_string(),
            control_address: "127.0.0.1:10010".to_string(),
            heartbeat_interval_ms: 2_000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl FromStr for WorkerConfig {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| ClusterError::config_with_source("failed to parse TOML config", e))
    }
}

impl WorkerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClusterError::config_with_source(
                format!("failed to read config file {}", path.display()),
                e,
            )
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("KMW_JOIN_ADDRESS") {
            self.join_address = val;
        }
        if let Ok(val) = std::env::var("KMW_WORK_ADDRESS") {
            self.work_address = val;
        }
        if let Ok(val) = std::env::var("KMW_CONTROL_ADDRESS") {
            self.control_address = val;
        }
        if let Ok(val) = std::env::var("KMW_HEARTBEAT_INTERVAL_MS") {
            if let Ok(v) = val.parse() {
                self.heartbeat_interval_ms = v;
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.join_address.is_empty()
            || self.work_address.is_empty()
            || self.control_address.is_empty()
        {
            return Err(ClusterError::config("worker addresses must not be empty"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ClusterError::config(
                "heartbeat_interval_ms must be greater than 0",
            ));
        }
        if self.max_frame_bytes == 0 {
            return Err(ClusterError::config(
                "max_frame_bytes must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}
