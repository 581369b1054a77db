//! Relay Application
//!
//! Receives the local UDP audio stream and publishes it through the
//! decoder/encoder/streamer chain until interrupted.
//!
//! Usage: `relay [port] [mount] [run_seconds]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use icecast_relay::{config::AppConfig, constants::*, relay::Adapter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting relay");

    let mut args = std::env::args().skip(1);
    let port: u16 = match args.next() {
        Some(arg) => arg.parse().with_context(|| format!("Invalid port: {}", arg))?,
        None => DEFAULT_UDP_PORT,
    };
    let mount = args.next().unwrap_or_else(|| DEFAULT_MOUNT.to_string());
    let run_for = match args.next() {
        Some(arg) => {
            let secs = arg.parse().with_context(|| format!("Invalid run time: {}", arg))?;
            Duration::from_secs(secs)
        }
        None => Duration::from_secs(DEFAULT_RUN_SECONDS),
    };

    // RELAY_CONFIG overrides the per-user config file
    let config = match std::env::var_os("RELAY_CONFIG") {
        Some(path) => AppConfig::load(&PathBuf::from(path))?,
        None => AppConfig::load_or_default()?,
    };

    let adapter = Arc::new(Adapter::new(port, mount, config));
    adapter.start()?;

    tracing::info!("{} running for {:?} - press Ctrl+C to stop", adapter, run_for);

    let mut stats_timer = tokio::time::interval(Duration::from_secs(STATS_INTERVAL_SECS));
    let deadline = tokio::time::sleep(run_for);
    let shutdown = shutdown_signal();
    tokio::pin!(deadline);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                tracing::info!("Run time elapsed");
                break;
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested");
                break;
            }
            _ = stats_timer.tick() => {
                if !adapter.is_running() {
                    tracing::warn!("{} stopped on its own", adapter);
                    break;
                }
                let stats = adapter.stats();
                tracing::info!(
                    "Stats: {} packets, {:.1} KB forwarded, {} timeouts",
                    stats.packets_forwarded,
                    stats.bytes_forwarded as f64 / 1024.0,
                    stats.receive_timeouts
                );
            }
        }
    }

    adapter.stop();
    adapter.destroy();

    let waiter = adapter.clone();
    let joined = tokio::task::spawn_blocking(move || waiter.wait(Duration::from_secs(10))).await?;
    if !joined {
        tracing::warn!("Forwarding thread did not finish in time");
    }

    tracing::info!("Done");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
