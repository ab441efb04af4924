//! Platform abstraction for process-table access
//!
//! The supervisor never touches the OS process table directly. Listing,
//! inspection, signalling and reaping all go through [`ProcessTable`], so the
//! reconciler and watchdog can be exercised against an in-memory table.

use thiserror::Error;

use crate::records::{Liveness, ProcessInfo};

/// Errors that can occur during process-table operations
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Platform not supported: {0}")]
    NotSupported(String),

    #[error("Signal delivery failed for pid {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },
}

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Termination signal strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TermSignal {
    /// SIGTERM
    Graceful,
    /// SIGKILL
    Forced,
}

impl TermSignal {
    pub fn name(&self) -> &'static str {
        match self {
            TermSignal::Graceful => "SIGTERM",
            TermSignal::Forced => "SIGKILL",
        }
    }
}

/// Access to the host process table
///
/// Implementations must treat a pid that no longer exists as success for
/// `signal` (the caller wanted it gone) and as `false` for `reap`.
pub trait ProcessTable: Send + Sync {
    /// Every process currently visible on the host
    fn snapshot(&self) -> PlatformResult<Vec<ProcessInfo>>;

    /// Liveness and aggregated resource usage for one pid
    ///
    /// `None` means the pid does not resolve.
    fn inspect(&self, pid: u32) -> Option<Liveness>;

    /// Deliver a termination signal to the pid's process group, falling back
    /// to the pid alone
    fn signal(&self, pid: u32, signal: TermSignal) -> PlatformResult<()>;

    /// Non-blocking reap of an exited child; `true` if a zombie was collected
    fn reap(&self, pid: u32) -> bool;
}
