//! ferry
//!
//! TLS-wrapping tunnel with two modes:
//! - client: accept plaintext locally, originate mutually authenticated TLS
//!   to the target
//! - server: terminate TLS with client-certificate authentication, forward
//!   plaintext to a local target
//!
//! Credentials reload on SIGUSR1 (and optionally on a timer). SIGTERM and
//! SIGINT stop accepting and drain established pairs.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ferry::config::{Cli, Config};
use ferry::tunnel::DrainOutcome;
use ferry::{app, signals};

/// Extra time past the drain deadline before giving up on a clean exit.
const HARD_STOP_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_cli(Cli::parse())?;

    // Initialize tracing (prefer RUST_LOG, fallback to --log-level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        mode = config.mode.name(),
        listen = %config.listen,
        target = %config.target,
        max_concurrent_conns = config.max_concurrent_conns,
        "Configuration loaded"
    );

    let shutdown_timeout = config.shutdown_timeout;
    let timed_reload = config.timed_reload;

    let tunnel = app::start(config).await.context("failed to start tunnel")?;

    signals::wait_for_shutdown(&tunnel, timed_reload)
        .await
        .context("failed to install signal handlers")?;

    tunnel.shutdown();

    let outcome = match tokio::time::timeout(shutdown_timeout + HARD_STOP_GRACE, tunnel.wait()).await
    {
        Ok(result) => result?,
        Err(_) => {
            error!("Drain did not complete, exiting");
            DrainOutcome::ForceClosed
        }
    };

    if outcome == DrainOutcome::ForceClosed {
        warn!("Pairs were force-closed at the shutdown deadline");
        std::process::exit(1);
    }

    info!("Shutdown complete");
    Ok(())
}
