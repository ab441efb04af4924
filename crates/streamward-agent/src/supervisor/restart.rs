//! Restart sequencer: terminate, relaunch, restamp the record

use chrono::{DateTime, Utc};
use streamward_common::MonitorRecord;

use super::{ControlError, Supervisor};
use crate::launcher::LaunchRequest;
use crate::monitor::{terminate, TerminationOutcome};
use crate::observability;

/// Result of a completed restart
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartOutcome {
    /// The record now points at `pid`
    Restarted {
        previous: Option<TerminationOutcome>,
        pid: u32,
    },
    /// The record was deleted while the pipeline was relaunching; the new
    /// pipeline has been terminated again
    RecordGone,
}

impl Supervisor {
    /// Replace a record's pipeline with a fresh one
    ///
    /// Every termination outcome leads to a relaunch. If the relaunch fails
    /// the record keeps its stale handle for the next tick to retry.
    pub async fn restart_record(
        &self,
        record: &MonitorRecord,
        now: DateTime<Utc>,
    ) -> Result<RestartOutcome, ControlError> {
        let previous = match record.process_handle {
            Some(pid) => {
                match terminate(self.processes.as_ref(), pid, self.settings.terminate_timeout).await {
                    Ok(outcome) => Some(outcome),
                    Err(e) => {
                        tracing::warn!(
                            pid,
                            record_id = %record.id,
                            channel = %record.channel,
                            error = %e,
                            "Could not terminate old pipeline, relaunching anyway"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        let request = LaunchRequest {
            session_id: record.id,
            owner_id: record.owner_id.clone(),
            channel: record.channel.clone(),
        };
        let pid = match self.launcher.launch(&request) {
            Ok(pid) => pid,
            Err(e) => {
                observability::launch_failures().inc();
                tracing::error!(
                    pid = ?record.process_handle,
                    record_id = %record.id,
                    owner = %record.owner_id,
                    channel = %record.channel,
                    error = %e,
                    "Relaunch failed; record keeps its stale handle"
                );
                return Err(e.into());
            }
        };
        observability::pipelines_launched().inc();

        // Re-read: a stop may have deleted the record while we relaunched
        let Some(mut current) = self.storage.get_monitor(&record.id)? else {
            tracing::info!(pid, record_id = %record.id, "Record deleted during restart, terminating new pipeline");
            let _ = terminate(self.processes.as_ref(), pid, self.settings.terminate_timeout).await;
            return Ok(RestartOutcome::RecordGone);
        };

        current.record_restart(pid, now);
        if !self.storage.update_monitor(&current)? {
            let _ = terminate(self.processes.as_ref(), pid, self.settings.terminate_timeout).await;
            return Ok(RestartOutcome::RecordGone);
        }

        observability::restarts().inc();
        self.after_mutation();
        tracing::info!(
            record_id = %current.id,
            owner = %current.owner_id,
            channel = %current.channel,
            old_pid = ?record.process_handle,
            pid,
            restart_count = current.restart_count,
            "Pipeline restarted"
        );
        Ok(RestartOutcome::Restarted { previous, pid })
    }
}
