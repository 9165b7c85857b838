use crate::error::{Result, WardenError};
use crate::process::supervisor::{LeaderHandle, TerminateCause};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Send `sig` to `pid`
///
/// A process that is already gone is not an error; its exit is reported
/// through the normal exit path.
pub fn send_signal(pid: u32, sig: Signal) -> Result<()> {
    let raw = i32::try_from(pid)
        .map_err(|_| WardenError::SignalError(format!("Invalid pid: {}", pid)))?;

    match signal::kill(Pid::from_raw(raw), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(WardenError::SignalError(format!(
            "Failed to send {} to {}: {}",
            sig, pid, e
        ))),
    }
}

/// Forward OS signals received by this process to the leader
///
/// SIGTERM and SIGINT are terminate-class, SIGHUP requests a restart. The
/// listener stops once the leader is gone.
pub fn listen_for_signals(handle: LeaderHandle) -> Result<JoinHandle<()>> {
    let install = |kind: SignalKind, name: &str| {
        unix_signal(kind).map_err(|e| {
            WardenError::SignalError(format!("Failed to set up {} handler: {}", name, e))
        })
    };

    let mut sigterm = install(SignalKind::terminate(), "SIGTERM")?;
    let mut sigint = install(SignalKind::interrupt(), "SIGINT")?;
    let mut sighup = install(SignalKind::hangup(), "SIGHUP")?;

    Ok(tokio::spawn(async move {
        loop {
            let delivered = tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    handle.terminate(TerminateCause::TerminationRequest)
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    handle.terminate(TerminateCause::Interrupt)
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP");
                    handle.request_restart()
                }
            };

            if let Err(e) = delivered {
                warn!("Signal not relayed: {}", e);
                break;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_to_exited_process_is_tolerated() {
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        assert!(send_signal(pid, Signal::SIGTERM).is_ok());
    }

    #[test]
    fn test_out_of_range_pid_is_rejected() {
        assert!(send_signal(u32::MAX, Signal::SIGTERM).is_err());
    }
}
