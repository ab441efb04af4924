//! Process-table access: liveness inspection and termination
//!
//! `SysinfoProcessTable` is the production [`ProcessTable`]; `terminate`
//! drives any table through the graceful-then-forced sequence.

mod sysinfo_table;
mod terminate;

#[cfg(test)]
pub mod mock;

pub use sysinfo_table::SysinfoProcessTable;
pub use terminate::{terminate, TerminationOutcome, POLL_INTERVAL};

pub use streamward_common::{Liveness, ProcessTable, TermSignal};
