//! Capture process supervisor
//!
//! `Supervisor` owns the desired-state store and keeps it in line with the
//! host process table. The control plane calls into it to start and stop
//! monitors; two periodic loops drive the watchdog (per-record health) and
//! the reconciler (drift repair). All three share one `Arc<Supervisor>`.
//!
//! Start and stop are check-then-act against the store. Two racing starts
//! for one owner can both pass the policy check; the reconciler's
//! deduplication step removes the loser.

mod cache;
mod reconciler;
mod restart;
pub mod segments;
mod watchdog;

#[cfg(test)]
pub(crate) mod fixtures;
#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use streamward_common::{
    normalize_channel, ChannelError, HealthSnapshot, Liveness, MonitorRecord, Principal,
    PipelineSignature, ProcessTable, UpstreamState,
};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::{AgentConfig, PipelineConfig};
use crate::launcher::{session_dir, LaunchError, LaunchRequest, Launcher};
use crate::monitor::terminate;
use crate::observability;
use crate::storage::Storage;
use crate::upstream::{ChannelStatus, StatusError, StatusProvider};

pub use cache::TtlCache;
pub use reconciler::SweepReport;
pub use restart::RestartOutcome;
pub use watchdog::{decide, HealthSignals, RestartReason, Thresholds, WatchdogAction, WatchdogReport};

/// Errors surfaced to control-plane callers
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Invalid channel: {0}")]
    Validation(#[from] ChannelError),

    #[error("{0}")]
    Policy(String),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Tunables shared by the control plane, watchdog and reconciler
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub grace_period: Duration,
    pub stale_after: Duration,
    pub cpu_warn_percent: f32,
    pub memory_warn_mb: f64,
    pub terminate_timeout: Duration,
    pub upstream_timeout: Duration,
    pub cache_ttl: Duration,
    pub pipeline: PipelineConfig,
}

impl SupervisorSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            grace_period: config.watchdog.grace_period(),
            stale_after: config.watchdog.stale_after(),
            cpu_warn_percent: config.watchdog.cpu_warn_percent,
            memory_warn_mb: config.watchdog.memory_warn_mb,
            terminate_timeout: config.watchdog.terminate_timeout(),
            upstream_timeout: config.upstream.timeout(),
            cache_ttl: Duration::from_secs(config.server.cache_ttl_secs),
            pipeline: config.pipeline.clone(),
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            stale_after: self.stale_after,
            cpu_warn_percent: self.cpu_warn_percent,
            memory_warn_mb: self.memory_warn_mb,
        }
    }
}

/// What the supervisor can see of one record's pipeline right now
#[derive(Debug, Clone)]
struct Observation {
    liveness: Option<Liveness>,
    in_grace: bool,
    segment_age: Option<Duration>,
}

impl Observation {
    fn alive(&self) -> bool {
        self.liveness.as_ref().is_some_and(|l| l.alive)
    }

    fn zombie(&self) -> bool {
        self.liveness.as_ref().is_some_and(|l| l.zombie)
    }
}

pub struct Supervisor {
    storage: Storage,
    processes: Arc<dyn ProcessTable>,
    launcher: Arc<dyn Launcher>,
    upstream: Arc<dyn StatusProvider>,
    signature: PipelineSignature,
    settings: SupervisorSettings,
    lists: TtlCache<Vec<MonitorRecord>>,
}

impl Supervisor {
    pub fn new(
        storage: Storage,
        processes: Arc<dyn ProcessTable>,
        launcher: Arc<dyn Launcher>,
        upstream: Arc<dyn StatusProvider>,
        settings: SupervisorSettings,
    ) -> anyhow::Result<Self> {
        let signature = PipelineSignature::new(
            &settings.pipeline.capture_binary,
            &settings.pipeline.segmenter_binary,
            &settings.pipeline.channel_url_template,
            &settings.pipeline.work_root,
        )?;

        Ok(Self {
            storage,
            processes,
            launcher,
            upstream,
            signature,
            lists: TtlCache::new(settings.cache_ttl),
            settings,
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Start capturing a channel for `principal`
    ///
    /// Non-privileged owners may hold one active monitor. A record for the
    /// same channel whose pipeline is dead is relaunched in place.
    pub async fn start_monitor(
        &self,
        principal: &Principal,
        channel_url: &str,
    ) -> Result<MonitorRecord, ControlError> {
        let channel = normalize_channel(channel_url)?;
        let now = Utc::now();
        let owned = self.storage.monitors_for_owner(&principal.owner_id)?;

        let mut reusable: Option<MonitorRecord> = None;
        for record in owned {
            if !record.is_active() {
                continue;
            }
            let occupied = self.handle_alive(&record)
                || record.in_grace_period(now, self.settings.grace_period);

            if occupied {
                if record.channel == channel && principal.is_privileged() {
                    return Ok(record);
                }
                if !principal.is_privileged() {
                    return Err(ControlError::Policy(if record.channel == channel {
                        format!("already monitoring {channel}")
                    } else {
                        format!(
                            "owner {} already monitors {}; stop it first",
                            principal.owner_id, record.channel
                        )
                    }));
                }
            } else if record.channel == channel && reusable.is_none() {
                reusable = Some(record);
            }
        }

        if let Some(pid) = reusable.as_ref().and_then(|r| r.process_handle) {
            // Leftover from the previous run; never signalled here
            self.processes.reap(pid);
        }

        let id = reusable.as_ref().map_or_else(Uuid::new_v4, |r| r.id);
        let request = LaunchRequest {
            session_id: id,
            owner_id: principal.owner_id.clone(),
            channel: channel.clone(),
        };
        let pid = match self.launcher.launch(&request) {
            Ok(pid) => pid,
            Err(e) => {
                observability::launch_failures().inc();
                tracing::error!(owner = %principal.owner_id, channel = %channel, error = %e, "Launch failed");
                return Err(e.into());
            }
        };
        observability::pipelines_launched().inc();

        let persisted = match reusable {
            Some(mut record) => {
                record.relaunch(principal, pid, now);
                self.storage.update_monitor(&record).and_then(|updated| {
                    if !updated {
                        self.storage.insert_monitor(&record)?;
                    }
                    Ok(record)
                })
            }
            None => {
                let record = MonitorRecord::new(id, principal, channel.clone(), pid);
                self.storage.insert_monitor(&record).map(|()| record)
            }
        };

        let record = match persisted {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(pid, channel = %channel, error = %e, "Failed to persist monitor, terminating pipeline");
                if let Err(kill_err) =
                    terminate(self.processes.as_ref(), pid, self.settings.terminate_timeout).await
                {
                    tracing::warn!(pid, error = %kill_err, "Failed to terminate unpersisted pipeline");
                }
                return Err(ControlError::Storage(e));
            }
        };

        self.after_mutation();
        tracing::info!(
            record_id = %record.id,
            owner = %record.owner_id,
            channel = %record.channel,
            pid,
            "Monitor started"
        );
        Ok(record)
    }

    /// Stop the owner's monitors for a channel; returns how many were removed
    ///
    /// Idempotent: stopping a channel with no monitor succeeds with zero.
    pub async fn stop_monitor(
        &self,
        principal: &Principal,
        channel_url: &str,
    ) -> Result<usize, ControlError> {
        let channel = normalize_channel(channel_url)?;
        let records: Vec<MonitorRecord> = self
            .storage
            .monitors_for_channel(&channel)?
            .into_iter()
            .filter(|r| r.owner_id == principal.owner_id)
            .collect();

        let mut removed = 0;
        for mut record in records {
            self.terminate_handle(&record).await;
            record.mark_stopped(Utc::now());
            if self.storage.delete_monitor(&record.id)? {
                removed += 1;
            }
            tracing::info!(record_id = %record.id, owner = %record.owner_id, channel = %record.channel, "Monitor stopped");
        }

        self.after_mutation();
        Ok(removed)
    }

    /// All records for privileged callers, the caller's own otherwise
    ///
    /// Never fails; a storage error yields an empty list.
    pub fn list_monitors(&self, principal: &Principal) -> Vec<MonitorRecord> {
        let key = if principal.is_privileged() {
            "*".to_string()
        } else {
            format!("owner:{}", principal.owner_id)
        };
        if let Some(cached) = self.lists.get(&key) {
            return cached;
        }

        let result = if principal.is_privileged() {
            self.storage.all_monitors()
        } else {
            self.storage.monitors_for_owner(&principal.owner_id)
        };
        match result {
            Ok(records) => {
                self.lists.put(key, records.clone());
                records
            }
            Err(e) => {
                tracing::error!(owner = %principal.owner_id, error = %e, "Failed to list monitors");
                Vec::new()
            }
        }
    }

    /// Derived health of a channel's monitor; never fails
    ///
    /// Computed from the live process table on every call, never cached.
    pub async fn monitor_health(&self, principal: &Principal, channel_url: &str) -> HealthSnapshot {
        let channel = match normalize_channel(channel_url) {
            Ok(channel) => channel,
            Err(e) => {
                let mut snapshot = HealthSnapshot::inactive(channel_url.trim());
                snapshot.warnings.push(e.to_string());
                return snapshot;
            }
        };

        let record = match self.storage.monitors_for_channel(&channel) {
            Ok(records) => records
                .into_iter()
                .filter(|r| r.is_active())
                .filter(|r| principal.is_privileged() || r.owner_id == principal.owner_id)
                .max_by_key(|r| (r.owner_id == principal.owner_id, r.last_launch_at())),
            Err(e) => {
                tracing::error!(channel = %channel, error = %e, "Failed to load monitor for health");
                None
            }
        };
        let Some(record) = record else {
            return HealthSnapshot::inactive(channel);
        };

        self.build_health(&record, Utc::now()).await
    }

    async fn build_health(&self, record: &MonitorRecord, now: DateTime<Utc>) -> HealthSnapshot {
        let observation = self.observe(record, now);
        let (upstream, status) = self.upstream_state(&record.channel).await;

        let mut snapshot = HealthSnapshot::inactive(record.channel.clone());
        snapshot.active = true;
        snapshot.status = Some(record.status);
        snapshot.process_handle = record.process_handle;
        snapshot.process_alive = observation.alive();
        snapshot.is_upstream_live = upstream.as_option();
        snapshot.viewer_count = status.and_then(|s| s.viewer_count);
        snapshot.uptime_secs = Some(record.launch_age(now).as_secs());
        snapshot.restart_count = record.restart_count;
        snapshot.last_segment_age_secs = observation.segment_age.map(|age| age.as_secs());

        if let Some(liveness) = observation.liveness.as_ref().filter(|l| l.alive) {
            snapshot.cpu_percent_aggregate = liveness.cpu_percent;
            snapshot.memory_mb = liveness.memory_mb();
        }

        let warnings = &mut snapshot.warnings;
        if observation.in_grace {
            warnings.push("pipeline is starting up".to_string());
        }
        if observation.zombie() {
            warnings.push("pipeline exited and awaits reaping".to_string());
        } else if !observation.alive() {
            warnings.push("pipeline process is not running".to_string());
        }
        if let Some(age) = observation.segment_age.filter(|age| *age > self.settings.stale_after) {
            warnings.push(format!("no segment activity for {}s", age.as_secs()));
        }
        if upstream == UpstreamState::Offline {
            warnings.push("upstream reports the channel offline".to_string());
        }
        if snapshot.cpu_percent_aggregate > self.settings.cpu_warn_percent {
            warnings.push(format!("cpu usage {:.0}%", snapshot.cpu_percent_aggregate));
        }
        if snapshot.memory_mb > self.settings.memory_warn_mb {
            warnings.push(format!("memory usage {:.0} MB", snapshot.memory_mb));
        }
        snapshot
    }

    /// Run the watchdog until `shutdown` flips; an in-flight tick completes
    pub async fn run_watchdog(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(interval_secs = interval.as_secs(), "Watchdog loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.watchdog_tick().await;
                    if report.acted() {
                        tracing::info!(?report, "Watchdog tick");
                    } else {
                        tracing::debug!(?report, "Watchdog tick");
                    }
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        tracing::info!("Watchdog loop stopped");
    }

    /// Run the reconciler until `shutdown` flips; an in-flight sweep completes
    pub async fn run_reconciler(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(interval_secs = interval.as_secs(), "Reconciler loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.reconcile().await {
                        Ok(report) if report.acted() => tracing::info!(?report, "Reconciler sweep"),
                        Ok(report) => tracing::debug!(?report, "Reconciler sweep"),
                        Err(e) => {
                            observability::errors_total().inc();
                            tracing::error!(error = %e, "Reconciler sweep failed");
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        tracing::info!("Reconciler loop stopped");
    }

    fn handle_alive(&self, record: &MonitorRecord) -> bool {
        record
            .process_handle
            .and_then(|pid| self.processes.inspect(pid))
            .is_some_and(|l| l.alive)
    }

    fn workdir(&self, record: &MonitorRecord) -> PathBuf {
        session_dir(
            &self.settings.pipeline.work_root,
            &record.owner_id,
            &record.channel,
            &record.id,
        )
    }

    fn observe(&self, record: &MonitorRecord, now: DateTime<Utc>) -> Observation {
        let liveness = record.process_handle.and_then(|pid| self.processes.inspect(pid));
        let alive = liveness.as_ref().is_some_and(|l| l.alive);
        let segment_age = alive.then(|| {
            segments::segment_age(&self.workdir(record), record.last_launch_at(), now)
        });
        Observation {
            liveness,
            in_grace: record.in_grace_period(now, self.settings.grace_period),
            segment_age,
        }
    }

    async fn upstream_state(&self, channel: &str) -> (UpstreamState, Option<ChannelStatus>) {
        let lookup = self.upstream.channel_status(channel);
        match tokio::time::timeout(self.settings.upstream_timeout, lookup).await {
            Ok(Ok(status)) => (UpstreamState::from_live(status.is_live), Some(status)),
            Ok(Err(StatusError::NotConfigured)) => (UpstreamState::Unknown, None),
            Ok(Err(e)) => {
                tracing::debug!(channel, error = %e, "Upstream status unavailable");
                (UpstreamState::Unknown, None)
            }
            Err(_) => {
                tracing::debug!(channel, "Upstream status timed out");
                (UpstreamState::Unknown, None)
            }
        }
    }

    /// Best-effort termination of a record's pipeline
    async fn terminate_handle(&self, record: &MonitorRecord) {
        let Some(pid) = record.process_handle else {
            return;
        };
        match terminate(self.processes.as_ref(), pid, self.settings.terminate_timeout).await {
            Ok(outcome) => tracing::debug!(
                pid,
                record_id = %record.id,
                outcome = outcome.as_str(),
                "Pipeline terminated"
            ),
            Err(e) => tracing::warn!(
                pid,
                record_id = %record.id,
                channel = %record.channel,
                error = %e,
                "Failed to terminate pipeline"
            ),
        }
    }

    fn after_mutation(&self) {
        self.lists.invalidate();
        match self.storage.active_monitors() {
            Ok(active) => observability::active_monitors().set(active.len() as u64),
            Err(e) => tracing::debug!(error = %e, "Could not refresh active monitor gauge"),
        }
    }
}
