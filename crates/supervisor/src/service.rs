//! Systemd service integration
//!
//! sd-notify support for running the supervisor as a `Type=notify` unit:
//! readiness once the first acquisition settles, status lines that show up
//! in `systemctl status`, and watchdog keepalives. Everything is a no-op
//! outside systemd.

use anyhow::{Context, Result};
use std::env;
use std::os::unix::net::UnixDatagram;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

fn notify(message: &str) -> Result<bool> {
    let Ok(socket_path) = env::var("NOTIFY_SOCKET") else {
        return Ok(false);
    };

    let socket = UnixDatagram::unbound().context("Failed to create Unix socket")?;
    socket
        .send_to(message.as_bytes(), &socket_path)
        .with_context(|| format!("Failed to send {} to systemd", message))?;
    Ok(true)
}

/// Notify systemd that the supervisor finished its startup sequence
pub fn notify_ready() -> Result<()> {
    if notify("READY=1")? {
        info!("Notified systemd: service ready");
    } else {
        debug!("NOTIFY_SOCKET not set, skipping systemd notification");
    }
    Ok(())
}

pub fn notify_stopping() -> Result<()> {
    if notify("STOPPING=1")? {
        info!("Notified systemd: service stopping");
    }
    Ok(())
}

/// Send watchdog keepalive to systemd
pub fn notify_watchdog() -> Result<()> {
    if notify("WATCHDOG=1")? {
        debug!("Notified systemd: watchdog keepalive");
    }
    Ok(())
}

/// Send a status line, visible in `systemctl status`
pub fn notify_status(status: &str) -> Result<()> {
    if notify(&format!("STATUS={}", status))? {
        debug!("Notified systemd: status = {}", status);
    }
    Ok(())
}

/// Best-effort status update for callers that cannot act on a failure
pub fn report_status(status: &str) {
    if let Err(e) = notify_status(status) {
        debug!("Status notification failed: {:#}", e);
    }
}

/// Watchdog timeout configured by systemd, in microseconds
pub fn get_watchdog_timeout() -> Option<u64> {
    env::var("WATCHDOG_USEC").ok().and_then(|s| s.parse().ok())
}

pub fn is_systemd() -> bool {
    env::var("NOTIFY_SOCKET").is_ok()
}

/// Keepalive interval: half the systemd watchdog timeout, at least a second
pub fn keepalive_interval(timeout_usec: u64) -> Duration {
    Duration::from_secs((timeout_usec / 1_000_000 / 2).max(1))
}

/// Spawn the systemd keepalive task.
///
/// Returns `None` when the unit has no `WatchdogSec=`.
pub fn spawn_keepalive_task() -> Option<JoinHandle<()>> {
    let Some(timeout_usec) = get_watchdog_timeout() else {
        debug!("Systemd watchdog not enabled, skipping keepalive task");
        return None;
    };

    let interval = keepalive_interval(timeout_usec);
    info!(
        "Systemd watchdog enabled, interval: {}s (timeout: {}s)",
        interval.as_secs(),
        timeout_usec / 1_000_000
    );

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = notify_watchdog() {
                error!("Failed to send watchdog keepalive: {:#}", e);
            }
        }
    }))
}
