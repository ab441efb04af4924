//! Graceful-then-forced termination of a pipeline

use std::time::Duration;

use streamward_common::{PlatformResult, ProcessTable, TermSignal};
use tokio::time::Instant;

/// Poll cadence while waiting for a signalled process to exit
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait for SIGKILL to take effect
const KILL_WAIT: Duration = Duration::from_secs(2);

/// How a termination request was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The pid did not resolve
    AlreadyGone,
    /// The pid was a zombie and has been collected without signalling
    Reaped,
    /// Exited after SIGTERM
    Graceful,
    /// Needed SIGKILL
    Forced,
}

impl TerminationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationOutcome::AlreadyGone => "already_gone",
            TerminationOutcome::Reaped => "reaped",
            TerminationOutcome::Graceful => "graceful",
            TerminationOutcome::Forced => "forced",
        }
    }
}

/// Wait until the pid is gone, reaping it if it turns into a zombie
async fn wait_for_exit(table: &dyn ProcessTable, pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match table.inspect(pid) {
            None => return true,
            Some(liveness) if liveness.zombie => {
                table.reap(pid);
                return true;
            }
            Some(_) => {}
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Terminate `pid`: reap if zombie, else SIGTERM, wait up to `timeout`, then
/// SIGKILL
///
/// A pid that does not resolve is treated as already terminated.
pub async fn terminate(
    table: &dyn ProcessTable,
    pid: u32,
    timeout: Duration,
) -> PlatformResult<TerminationOutcome> {
    let Some(liveness) = table.inspect(pid) else {
        return Ok(TerminationOutcome::AlreadyGone);
    };

    if liveness.zombie {
        table.reap(pid);
        tracing::debug!(pid, "Reaped zombie pipeline");
        return Ok(TerminationOutcome::Reaped);
    }

    table.signal(pid, TermSignal::Graceful)?;
    if wait_for_exit(table, pid, timeout).await {
        tracing::debug!(pid, "Pipeline exited after SIGTERM");
        return Ok(TerminationOutcome::Graceful);
    }

    tracing::warn!(pid, timeout_secs = timeout.as_secs(), "Pipeline ignored SIGTERM, sending SIGKILL");
    table.signal(pid, TermSignal::Forced)?;
    if !wait_for_exit(table, pid, KILL_WAIT).await {
        tracing::warn!(pid, "Pipeline still present after SIGKILL");
    }
    Ok(TerminationOutcome::Forced)
}
