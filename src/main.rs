//! Tenant DB Pool - operator entry point.
//!
//! Bootstraps the control-plane schema, probes database URLs and runs the
//! pool monitors for a configured control plane.

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tenant_db_pool::config::{Command, Config};
use tenant_db_pool::db::ConnectionManager;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(
    manager: Arc<ConnectionManager>,
    stats_interval: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let key = manager.config().control_plane_key.clone();
    manager.get_pool(&key, None).await?;
    manager.start();

    let period = Duration::from_secs(stats_interval.max(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            _ = ticker.tick() => {
                for stats in manager.all_pool_stats().await.values() {
                    info!(
                        pool_key = %stats.key,
                        health = %stats.health,
                        acquired = stats.acquired,
                        idle = stats.idle,
                        pending = stats.pending,
                        total_connections = stats.total_connections,
                        "Pool stats"
                    );
                }
                info!(
                    high_load = manager.governor().is_high_load(),
                    pools_created = manager.pools_created(),
                    "Manager stats"
                );
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    let manager_config = config.manager_config()?;
    info!(
        control_plane = %manager_config.control_plane_key,
        "Starting tenant-db-pool v{}",
        env!("CARGO_PKG_VERSION")
    );
    let manager = ConnectionManager::new(manager_config)?;

    let result = match config.command {
        Command::Bootstrap => {
            let bootstrapper = manager.bootstrapper();
            match bootstrapper.ensure_connection().await {
                Ok(_) => match bootstrapper.initialize_tables().await {
                    Ok(report) => print_json(&report),
                    Err(e) => Err(e.into()),
                },
                Err(e) => Err(e.into()),
            }
        }
        Command::Check { url } => {
            let result = manager.test_connection(&url).await;
            let success = result.success;
            print_json(&result)?;
            if !success {
                manager.shutdown().await;
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Run { stats_interval } => run(Arc::clone(&manager), stats_interval).await,
    };

    manager.shutdown().await;
    if let Err(e) = result {
        error!(error = %e, "Command failed");
        return Err(e);
    }
    Ok(())
}
