//! Reconciler: sweep the store against the live process table
//!
//! Steps run in a fixed order and each derives from fresh state:
//! discovery, cross-reference, orphan termination, stray segmenter cleanup,
//! deduplication, drift repair. Roots that a dead record can adopt are held
//! back from orphan termination; if deduplication then deletes that record,
//! the held-back root is terminated as an orphan in the same sweep.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use streamward_common::{DiscoveredPipeline, MonitorRecord, MonitorStatus, ProcessInfo};
use uuid::Uuid;

use super::Supervisor;
use crate::launcher::path_component;
use crate::monitor::terminate;
use crate::observability;

/// Upper bound on parent hops when walking a segmenter's ancestry
const MAX_ANCESTRY_DEPTH: usize = 32;

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub discovered: usize,
    pub orphans_killed: usize,
    pub strays_killed: usize,
    pub duplicates_removed: usize,
    pub adopted: usize,
    pub marked_dead: usize,
    pub failures: usize,
}

impl SweepReport {
    pub fn acted(&self) -> bool {
        self.orphans_killed
            + self.strays_killed
            + self.duplicates_removed
            + self.adopted
            + self.marked_dead
            + self.failures
            > 0
    }
}

impl Supervisor {
    pub async fn reconcile(self: &Arc<Self>) -> anyhow::Result<SweepReport> {
        self.reconcile_at(Utc::now()).await
    }

    /// One full sweep as of `now`
    pub async fn reconcile_at(self: &Arc<Self>, now: DateTime<Utc>) -> anyhow::Result<SweepReport> {
        let _timer = observability::reconciler_latency().start_timer();
        let mut report = SweepReport::default();

        let processes = self.processes.snapshot()?;
        let roots = self.signature.discover(&processes);
        report.discovered = roots.len();

        let records = self.storage.active_monitors()?;
        let referenced: HashSet<u32> = records.iter().filter_map(|r| r.process_handle).collect();
        let live_referenced: HashSet<u32> = referenced
            .iter()
            .copied()
            .filter(|pid| self.processes.inspect(*pid).is_some_and(|l| l.alive))
            .collect();

        let reserved = self.reserve_adoptions(&records, &roots, &referenced, &live_referenced);
        let reserved_pids: HashSet<u32> = reserved.values().copied().collect();

        // Orphans
        for root in &roots {
            if referenced.contains(&root.pid) || reserved_pids.contains(&root.pid) {
                continue;
            }
            self.kill_orphan(root, now, &mut report).await;
        }

        // Strays: segmenters whose pipeline root is gone
        let root_pids: HashSet<u32> = roots.iter().map(|r| r.pid).collect();
        let protected: HashSet<u32> = live_referenced.union(&root_pids).copied().collect();
        let parents: HashMap<u32, Option<u32>> = processes.iter().map(|p| (p.pid, p.ppid)).collect();
        for process in processes.iter().filter(|p| self.signature.is_segmenter(p)) {
            if has_protected_ancestor(process, &parents, &protected) {
                continue;
            }
            if self.younger_than_grace(process.start_time, now) {
                continue;
            }
            if !self.processes.inspect(process.pid).is_some_and(|l| l.alive) {
                continue;
            }
            match terminate(self.processes.as_ref(), process.pid, self.settings.terminate_timeout).await {
                Ok(_) => {
                    report.strays_killed += 1;
                    observability::strays_killed().inc();
                    tracing::warn!(pid = process.pid, ppid = ?process.ppid, "Terminated stray segmenter");
                }
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(pid = process.pid, error = %e, "Failed to terminate stray segmenter");
                }
            }
        }

        let removed = self.deduplicate(&mut report).await?;

        // Roots held back for a record that deduplication just deleted
        for (record_id, pid) in &reserved {
            if !removed.contains(record_id) {
                continue;
            }
            if let Some(root) = roots.iter().find(|r| r.pid == *pid) {
                self.kill_orphan(root, now, &mut report).await;
            }
        }

        // Drift repair against a fresh view of the store
        let records = self.storage.active_monitors()?;
        for record in records {
            if record.status != MonitorStatus::Running || removed.contains(&record.id) {
                continue;
            }
            if let Err(e) = self.repair_drift(record.clone(), reserved.get(&record.id).copied(), now, &mut report) {
                report.failures += 1;
                observability::errors_total().inc();
                tracing::warn!(record_id = %record.id, channel = %record.channel, error = %e, "Drift repair failed");
            }
        }

        self.after_mutation();
        Ok(report)
    }

    /// Terminate an unclaimed root unless it is still inside the grace period
    async fn kill_orphan(&self, root: &DiscoveredPipeline, now: DateTime<Utc>, report: &mut SweepReport) {
        if self.younger_than_grace(root.start_time, now) {
            tracing::debug!(pid = root.pid, channel = %root.channel, "Unreferenced pipeline still in grace period");
            return;
        }
        match terminate(self.processes.as_ref(), root.pid, self.settings.terminate_timeout).await {
            Ok(outcome) => {
                report.orphans_killed += 1;
                observability::orphans_killed().inc();
                tracing::warn!(
                    pid = root.pid,
                    channel = %root.channel,
                    owner = ?root.owner,
                    outcome = outcome.as_str(),
                    "Terminated orphaned pipeline"
                );
            }
            Err(e) => {
                report.failures += 1;
                tracing::warn!(pid = root.pid, channel = %root.channel, error = %e, "Failed to terminate orphan");
            }
        }
    }

    /// Pair dead `running` records with a discovered root they may adopt
    ///
    /// A root is claimable by a record of the same channel whose owner
    /// matches the root's work directory (or the root has none). A root
    /// whose session id names the record wins outright; otherwise the
    /// channel must have exactly one candidate record.
    fn reserve_adoptions(
        &self,
        records: &[MonitorRecord],
        roots: &[DiscoveredPipeline],
        referenced: &HashSet<u32>,
        live_referenced: &HashSet<u32>,
    ) -> HashMap<Uuid, u32> {
        let dead: Vec<&MonitorRecord> = records
            .iter()
            .filter(|r| r.status == MonitorStatus::Running)
            .filter(|r| !r.process_handle.is_some_and(|pid| live_referenced.contains(&pid)))
            .collect();

        let mut reserved: HashMap<Uuid, u32> = HashMap::new();
        let mut claimed: HashSet<u32> = HashSet::new();

        for root in roots.iter().filter(|root| !referenced.contains(&root.pid)) {
            let candidates: Vec<&MonitorRecord> = dead
                .iter()
                .copied()
                .filter(|r| r.channel == root.channel && !reserved.contains_key(&r.id))
                .filter(|r| {
                    root.owner
                        .as_deref()
                        .map_or(true, |owner| owner == path_component(&r.owner_id))
                })
                .collect();

            let chosen = root
                .session
                .and_then(|session| candidates.iter().find(|r| r.id == session).copied())
                .or_else(|| (candidates.len() == 1).then(|| candidates[0]));

            if let Some(record) = chosen {
                if claimed.insert(root.pid) {
                    reserved.insert(record.id, root.pid);
                }
            }
        }
        reserved
    }

    /// Remove duplicate `running` records; returns the ids deleted
    ///
    /// Every owner keeps at most one record per channel. Non-privileged
    /// owners keep at most one record overall.
    async fn deduplicate(&self, report: &mut SweepReport) -> anyhow::Result<HashSet<Uuid>> {
        let running = self.storage.monitors_with_status(MonitorStatus::Running)?;
        let alive: HashSet<Uuid> = running
            .iter()
            .filter(|r| self.handle_alive(r))
            .map(|r| r.id)
            .collect();

        let mut groups: HashMap<(String, Option<String>), Vec<&MonitorRecord>> = HashMap::new();
        for record in &running {
            let channel = record.is_privileged.then(|| record.channel.clone());
            groups
                .entry((record.owner_id.clone(), channel))
                .or_default()
                .push(record);
        }

        let mut removed = HashSet::new();
        for group in groups.values().filter(|g| g.len() > 1) {
            let Some(keep) = group
                .iter()
                .max_by_key(|r| (alive.contains(&r.id), r.last_launch_at()))
                .map(|r| r.id)
            else {
                continue;
            };

            for record in group.iter().filter(|r| r.id != keep) {
                self.terminate_handle(record).await;
                match self.storage.delete_monitor(&record.id) {
                    Ok(_) => {
                        removed.insert(record.id);
                        report.duplicates_removed += 1;
                        observability::duplicates_removed().inc();
                        tracing::warn!(
                            record_id = %record.id,
                            kept = %keep,
                            owner = %record.owner_id,
                            channel = %record.channel,
                            "Removed duplicate monitor"
                        );
                    }
                    Err(e) => {
                        report.failures += 1;
                        tracing::warn!(record_id = %record.id, error = %e, "Failed to delete duplicate monitor");
                    }
                }
            }
        }
        Ok(removed)
    }

    fn repair_drift(
        &self,
        mut record: MonitorRecord,
        adoptable: Option<u32>,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> anyhow::Result<()> {
        let liveness = record.process_handle.and_then(|pid| self.processes.inspect(pid));
        if liveness.as_ref().is_some_and(|l| l.alive) {
            return Ok(());
        }
        if let Some(pid) = record.process_handle.filter(|_| liveness.as_ref().is_some_and(|l| l.zombie)) {
            self.processes.reap(pid);
        }

        if let Some(pid) = adoptable {
            let old = record.process_handle;
            record.process_handle = Some(pid);
            if self.storage.update_monitor(&record)? {
                report.adopted += 1;
                observability::pipelines_adopted().inc();
                tracing::info!(
                    record_id = %record.id,
                    owner = %record.owner_id,
                    channel = %record.channel,
                    old_pid = ?old,
                    pid,
                    "Adopted running pipeline"
                );
            }
            return Ok(());
        }

        if record.in_grace_period(now, self.settings.grace_period) {
            return Ok(());
        }

        record.mark_stopped(now);
        if self.storage.delete_monitor(&record.id)? {
            report.marked_dead += 1;
            observability::records_marked_dead().inc();
            tracing::warn!(
                record_id = %record.id,
                owner = %record.owner_id,
                channel = %record.channel,
                "Pipeline gone, monitor stopped"
            );
        }
        Ok(())
    }

    fn younger_than_grace(&self, started: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        (now - started)
            .to_std()
            .map_or(true, |age| age < self.settings.grace_period)
    }
}

fn has_protected_ancestor(
    process: &ProcessInfo,
    parents: &HashMap<u32, Option<u32>>,
    protected: &HashSet<u32>,
) -> bool {
    let mut current = process.ppid;
    for _ in 0..MAX_ANCESTRY_DEPTH {
        match current {
            Some(pid) if protected.contains(&pid) => return true,
            Some(pid) if pid > 1 => current = parents.get(&pid).copied().flatten(),
            _ => return false,
        }
    }
    false
}
