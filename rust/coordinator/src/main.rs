//! Distributed K-Means Coordinator
//!
//! Admits workers, pushes point groups to them and recomputes the centroids
//! after every iteration until they converge.
//!
//! # Usage
//!
//! ```bash
//! # Cluster a CSV of x,y points into 5 clusters
//! kmeans-coordinator --input points.csv --k 5
//!
//! # Start with a configuration file and persist every iteration's centroids
//! kmeans-coordinator --config coordinator.toml --input points.csv --results centroids.csv
//! ```

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kmeans_core::{CoordinatorConfig, CsvPointSource, PhaseCoordinator, TcpTransport};

/// Distributed K-Means Coordinator
#[derive(Parser, Debug)]
#[command(name = "kmeans-coordinator")]
#[command(about = "Coordinator for distributed K-Means clustering")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Input file with one `x,y` point per line
    #[arg(short, long)]
    input: String,

    /// Append each iteration's centroids to this file
    #[arg(short, long)]
    results: Option<String>,

    /// Number of clusters
    #[arg(short, long)]
    k: Option<usize>,

    /// Points per group
    #[arg(long)]
    group_size: Option<usize>,

    /// Pushes per group
    #[arg(long)]
    redundancy: Option<u32>,

    /// Workers required before distribution starts
    #[arg(long)]
    min_workers: Option<usize>,

    /// Address for the work channel
    #[arg(long)]
    work_address: Option<String>,

    /// Address for the control channel
    #[arg(long)]
    control_address: Option<String>,

    /// Address for the join channel
    #[arg(long)]
    join_address: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(&self, config: &mut CoordinatorConfig) {
        if let Some(k) = self.k {
            config.convergence.k = k;
        }
        if let Some(group_size) = self.group_size {
            config.distribution.group_size = group_size;
        }
        if let Some(redundancy) = self.redundancy {
            config.distribution.redundancy = redundancy;
        }
        if let Some(min_workers) = self.min_workers {
            config.collection.min_workers = min_workers;
        }
        if let Some(address) = &self.work_address {
            config.network.work_address = address.clone();
        }
        if let Some(address) = &self.control_address {
            config.network.control_address = address.clone();
        }
        if let Some(address) = &self.join_address {
            config.network.join_address = address.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => CoordinatorConfig::from_file(path)?,
        None => CoordinatorConfig::default(),
    }
    .with_env_overrides();
    args.apply(&mut config);
    config.validate()?;

    tracing::info!("Starting K-Means Coordinator");
    tracing::info!("  Input: {}", args.input);
    tracing::info!("  Clusters: {}", config.convergence.k);
    tracing::info!("  Group size: {}", config.distribution.group_size);
    tracing::info!("  Redundancy: {}", config.distribution.redundancy);
    tracing::info!("  Collection timeout: {}ms", config.collection.timeout_ms);

    let mut source = CsvPointSource::open(&args.input)?;
    if let Some(results) = &args.results {
        source = source.with_results(results);
    }

    let cancel = CancellationToken::new();
    let transport = TcpTransport::bind(
        &config.network,
        config.distribution.work_backlog,
        cancel.clone(),
    )
    .await?;

    let coordinator = PhaseCoordinator::new(config, Box::new(source), transport.into_transport())?;

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down coordinator...");
            shutdown.cancel();
        }
    });

    let summary = coordinator.run(cancel.clone()).await?;
    cancel.cancel();

    tracing::info!(
        "Finished after {} iterations (converged: {})",
        summary.iterations,
        summary.converged
    );
    for centroid in &summary.centroids.centroids {
        tracing::info!(
            "  Centroid {}: ({}, {})",
            centroid.index,
            centroid.position.x,
            centroid.position.y
        );
    }

    Ok(())
}
