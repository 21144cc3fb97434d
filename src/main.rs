//! dnsveil - Entry point.
//!
//! Brings up the virtual interface, answers blocked DNS queries locally and
//! forwards the rest. Network changes are reported with signals:
//! `SIGUSR1` means the network is gone, `SIGUSR2` that it is back.

use std::borrow::Cow;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use dnsveil::config::Config;
use dnsveil::dns::Blocker;
use dnsveil::status::StatusReceiver;
use dnsveil::tunnel::linux::LinuxPlatform;
use dnsveil::{Supervisor, TunnelStatus};

type SharedSupervisor = Arc<Mutex<Supervisor<LinuxPlatform>>>;

/// Log every status change until the supervisor goes away.
fn spawn_status_task(mut status: StatusReceiver) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            debug!(status = %current, "{}", current.notification_text());
            if current == TunnelStatus::Stopped {
                warn!("Tunnel stopped");
            }
        }
    })
}

/// Run a supervisor command off the async runtime.
async fn with_supervisor<F, R>(supervisor: &SharedSupervisor, command: F) -> Result<R>
where
    F: FnOnce(&mut Supervisor<LinuxPlatform>) -> R + Send + 'static,
    R: Send + 'static,
{
    let supervisor = Arc::clone(supervisor);
    tokio::task::spawn_blocking(move || command(&mut supervisor.lock()))
        .await
        .context("Supervisor task failed")
}

/// Forward network signals until Ctrl-C or SIGTERM.
async fn wait_for_shutdown(supervisor: &SharedSupervisor) -> Result<()> {
    let mut network_lost =
        signal(SignalKind::user_defined1()).context("Failed to register SIGUSR1 handler")?;
    let mut network_available =
        signal(SignalKind::user_defined2()).context("Failed to register SIGUSR2 handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down...");
                return Ok(());
            }
            _ = terminate.recv() => {
                info!("SIGTERM received, shutting down...");
                return Ok(());
            }
            _ = network_lost.recv() => {
                info!("Network lost");
                with_supervisor(supervisor, |supervisor| supervisor.on_network_lost()).await?;
            }
            _ = network_available.recv() => {
                info!("Network available");
                with_supervisor(supervisor, |supervisor| supervisor.on_network_available()).await?;
            }
        }
    }
}

async fn run() -> Result<()> {
    let config_path = std::env::var("CONFIG_PATH")
        .map(Cow::Owned)
        .unwrap_or(Cow::Borrowed("config.toml"));
    let config = Config::load(config_path.as_ref()).context("Failed to load configuration")?;

    // Initialize metrics (must be done early, before any metrics are recorded)
    dnsveil::metrics::init(&config.metrics).context("Failed to initialize metrics")?;
    if config.metrics.enabled {
        info!("Metrics enabled on {}", config.metrics.listen);
    }

    info!("Starting dnsveil on {}...", config.tunnel.name);
    info!("Inline blocklist entries: {}", config.blocklist.len());
    info!(
        "Custom DNS servers: {}",
        config.enabled_dns_servers().count()
    );

    let blocker = Arc::new(Blocker::new(&config.blocklist));
    let platform = Arc::new(LinuxPlatform::new());
    let supervisor: SharedSupervisor =
        Arc::new(Mutex::new(Supervisor::new(platform, blocker, config)));

    let status = with_supervisor(&supervisor, |supervisor| supervisor.status()).await?;
    let status_handle = spawn_status_task(status);

    with_supervisor(&supervisor, Supervisor::start)
        .await?
        .context("Failed to start tunnel")?;

    wait_for_shutdown(&supervisor).await?;

    let block_log_len = with_supervisor(&supervisor, |supervisor| {
        supervisor.stop();
        supervisor.block_log().len()
    })
    .await?;
    info!("Block log holds {block_log_len} names");

    status_handle.abort();

    info!("Shutdown complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    run().await
}
