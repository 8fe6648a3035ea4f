//! Process signal handling.
//!
//! - `SIGTERM` / `SIGINT`: return so the caller can shut down and drain
//! - `SIGUSR1`: reload credentials
//! - optional timer: reload credentials every `timed_reload`

use std::io;
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::app::RunningTunnel;

/// Handle signals until a termination signal arrives.
#[cfg(unix)]
pub async fn wait_for_shutdown(
    tunnel: &RunningTunnel,
    timed_reload: Option<Duration>,
) -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut timer = reload_timer(timed_reload);

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!(signal = "SIGTERM", "Received shutdown signal");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!(signal = "SIGINT", "Received shutdown signal");
                return Ok(());
            }
            _ = sigusr1.recv() => {
                info!(signal = "SIGUSR1", "Reloading credentials");
                reload(tunnel);
            }
            _ = next_tick(&mut timer) => {
                debug!("Timed credential reload");
                reload(tunnel);
            }
        }
    }
}

/// Handle signals until a termination signal arrives.
#[cfg(not(unix))]
pub async fn wait_for_shutdown(
    tunnel: &RunningTunnel,
    timed_reload: Option<Duration>,
) -> io::Result<()> {
    let mut timer = reload_timer(timed_reload);

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!(signal = "ctrl_c", "Received shutdown signal");
                return Ok(());
            }
            _ = next_tick(&mut timer) => {
                debug!("Timed credential reload");
                reload(tunnel);
            }
        }
    }
}

fn reload(tunnel: &RunningTunnel) {
    // Failures are logged by the tunnel and the previous credential stays.
    if let Ok(version) = tunnel.reload() {
        info!(credential_version = version, "Credentials active");
    }
}

fn reload_timer(period: Option<Duration>) -> Option<Interval> {
    period.map(|period| {
        let mut timer = tokio::time::interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    })
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
