// Operator control - Stop commands and registry listings

use crate::config::Config;
use crate::error::{Result, WardenError};
use crate::process::send_signal;
use crate::registry::{is_process_alive, PidRecord, PidRegistry};
use nix::sys::signal::Signal;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One row of the running or deaf listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppRow {
    pub app: String,
    pub child_pid: u32,
    pub supervisor_pid: u32,
    /// Port from the configuration, if the application is still configured
    pub port: Option<u16>,
}

impl AppRow {
    fn from_record(record: PidRecord, config: Option<&Config>) -> Self {
        let port = config
            .and_then(|c| c.app(&record.app).ok())
            .map(|descriptor| descriptor.port);

        Self {
            app: record.app,
            child_pid: record.child_pid,
            supervisor_pid: record.supervisor_pid,
            port,
        }
    }
}

/// Stop the recorded child of an application
///
/// Sends SIGTERM, waits up to `grace` for the child to go away and sends
/// SIGKILL if it did not. The running record is removed either way.
///
/// # Returns
/// * `Ok(PidRecord)` - The record of the stopped child
/// * `Err(WardenError)` - `NotRunning` if there is no live record, or a signal/registry failure
pub async fn stop(registry: &PidRegistry, name: &str, grace: Duration) -> Result<PidRecord> {
    if !registry.is_running(name)? {
        return Err(WardenError::NotRunning(name.to_string()));
    }

    let record = registry
        .read(name)?
        .ok_or_else(|| WardenError::NotRunning(name.to_string()))?;
    let pid = record.child_pid;

    info!(app = %name, pid, "Stopping with SIGTERM");
    send_signal(pid, Signal::SIGTERM)?;

    if !wait_for_exit(pid, grace).await {
        warn!(app = %name, pid, "Still alive after {:?}, sending SIGKILL", grace);
        send_signal(pid, Signal::SIGKILL)?;
    }

    registry.remove(name)?;
    info!(app = %name, pid, "Stopped");

    Ok(record)
}

/// Stop every configured application that is running
///
/// Failures are logged and do not interrupt the others. Returns the number
/// of applications stopped.
pub async fn stop_all(registry: &PidRegistry, config: &Config, grace: Duration) -> usize {
    let mut stopped = 0;

    for app in &config.apps {
        match stop(registry, &app.name, grace).await {
            Ok(_) => stopped += 1,
            Err(WardenError::NotRunning(_)) => debug!(app = %app.name, "Not running"),
            Err(e) => error!(app = %app.name, "Failed to stop: {}", e),
        }
    }

    stopped
}

/// Running applications, pruned of stale records
pub fn running_apps(registry: &PidRegistry, config: &Config) -> Result<Vec<AppRow>> {
    Ok(registry
        .list_running()?
        .into_iter()
        .map(|record| AppRow::from_record(record, Some(config)))
        .collect())
}

/// Deaf children that are still alive
pub fn deaf_apps(registry: &PidRegistry) -> Result<Vec<AppRow>> {
    Ok(registry
        .list_deaf()?
        .into_iter()
        .map(|record| AppRow::from_record(record, None))
        .collect())
}

async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let start = Instant::now();

    while start.elapsed() < timeout {
        if !is_process_alive(pid) {
            return true;
        }
        sleep(EXIT_POLL_INTERVAL).await;
    }

    !is_process_alive(pid)
}
