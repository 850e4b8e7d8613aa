//! Distributed K-Means Worker
//!
//! Joins a coordinator, assigns every received point to its nearest centroid
//! and returns the partial sums when asked.
//!
//! # Usage
//!
//! ```bash
//! # Connect to a coordinator on the default local ports
//! kmeans-worker
//!
//! # Connect to a remote coordinator
//! kmeans-worker --host 10.0.0.5
//! ```

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kmeans_core::{TcpWorkerLink, WorkerConfig, WorkerSession};

/// Distributed K-Means Worker
#[derive(Parser, Debug)]
#[command(name = "kmeans-worker")]
#[command(about = "Worker process for distributed K-Means clustering")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Coordinator host; replaces the host of every configured address
    #[arg(long)]
    host: Option<String>,

    /// Heartbeat interval in milliseconds
    #[arg(long)]
    heartbeat_interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn with_host(address: &str, host: &str) -> String {
    match address.rsplit_once(':') {
        Some((_, port)) => format!("{}:{}", host, port),
        None => address.to_string(),
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
        Some(path) => WorkerConfig::from_file(path)?,
        None => WorkerConfig::default(),
    }
    .with_env_overrides();
    if let Some(host) = &args.host {
        config.join_address = with_host(&config.join_address, host);
        config.work_address = with_host(&config.work_address, host);
        config.control_address = with_host(&config.control_address, host);
    }
    if let Some(interval) = args.heartbeat_interval {
        config.heartbeat_interval_ms = interval;
    }
    config.validate()?;

    tracing::info!("Starting K-Means Worker");
    tracing::info!("  Join: {}", config.join_address);
    tracing::info!("  Work: {}", config.work_address);
    tracing::info!("  Control: {}", config.control_address);

    let link = TcpWorkerLink::connect(&config).await?;
    let mut session = WorkerSession::new(link, &config);
    let id = session.join().await?;
    tracing::info!("Joined as worker {}", id);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down worker...");
            shutdown.cancel();
        }
    });

    let processed = session.run(cancel).await?;
    tracing::info!("Processed {} points", processed);

    Ok(())
}
