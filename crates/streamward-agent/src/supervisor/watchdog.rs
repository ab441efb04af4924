//! Watchdog: per-record health evaluation
//!
//! Signals are gathered per record and fed to [`decide`], a pure function.
//! Priority, first match wins: dead process, stale segments, upstream
//! offline, resource warnings. A dead verdict inside the startup grace
//! period is suppressed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use streamward_common::{MonitorRecord, MonitorStatus, UpstreamState};
use tokio::task::JoinSet;

use super::{ControlError, Supervisor};
use crate::observability;

#[derive(Debug, Clone, PartialEq)]
pub struct HealthSignals {
    /// Running and not a zombie
    pub process_alive: bool,
    pub in_grace: bool,
    /// `None` when not measured
    pub segment_age: Option<Duration>,
    pub upstream: UpstreamState,
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    pub stale_after: Duration,
    pub cpu_warn_percent: f32,
    pub memory_warn_mb: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    ProcessDead,
    SegmentsStale,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchdogAction {
    None,
    Restart(RestartReason),
    Pause,
    Warn(Vec<String>),
}

pub fn decide(signals: &HealthSignals, thresholds: &Thresholds) -> WatchdogAction {
    if !signals.process_alive {
        return if signals.in_grace {
            WatchdogAction::None
        } else {
            WatchdogAction::Restart(RestartReason::ProcessDead)
        };
    }

    if signals
        .segment_age
        .is_some_and(|age| age > thresholds.stale_after)
    {
        return WatchdogAction::Restart(RestartReason::SegmentsStale);
    }

    if signals.upstream == UpstreamState::Offline {
        return WatchdogAction::Pause;
    }

    let mut warnings = Vec::new();
    if signals.cpu_percent > thresholds.cpu_warn_percent {
        warnings.push(format!(
            "cpu {:.0}% above {:.0}%",
            signals.cpu_percent, thresholds.cpu_warn_percent
        ));
    }
    if signals.memory_mb > thresholds.memory_warn_mb {
        warnings.push(format!(
            "memory {:.0} MB above {:.0} MB",
            signals.memory_mb, thresholds.memory_warn_mb
        ));
    }
    if warnings.is_empty() {
        WatchdogAction::None
    } else {
        WatchdogAction::Warn(warnings)
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchdogReport {
    pub evaluated: usize,
    pub restarted: usize,
    pub paused: usize,
    pub resumed: usize,
    pub warned: usize,
    pub failed: usize,
}

impl WatchdogReport {
    pub fn acted(&self) -> bool {
        self.restarted + self.paused + self.resumed + self.failed > 0
    }
}

/// Outcome of evaluating one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Evaluation {
    Quiet,
    Restarted,
    Paused,
    Resumed,
    Warned,
}

impl Supervisor {
    pub async fn watchdog_tick(self: &Arc<Self>) -> WatchdogReport {
        self.watchdog_tick_at(Utc::now()).await
    }

    /// Evaluate every `running` and `paused` record as of `now`
    pub async fn watchdog_tick_at(self: &Arc<Self>, now: DateTime<Utc>) -> WatchdogReport {
        let _timer = observability::watchdog_latency().start_timer();
        let mut report = WatchdogReport::default();

        let records = match self.storage.active_monitors() {
            Ok(records) => records,
            Err(e) => {
                observability::errors_total().inc();
                tracing::error!(error = %e, "Watchdog could not load monitors");
                report.failed += 1;
                return report;
            }
        };

        let mut tasks = JoinSet::new();
        for record in records {
            let supervisor = Arc::clone(self);
            tasks.spawn(async move {
                let outcome = supervisor.evaluate(&record, now).await;
                (record, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            report.evaluated += 1;
            match joined {
                Ok((_, Ok(Evaluation::Quiet))) => {}
                Ok((_, Ok(Evaluation::Restarted))) => report.restarted += 1,
                Ok((_, Ok(Evaluation::Paused))) => report.paused += 1,
                Ok((_, Ok(Evaluation::Resumed))) => report.resumed += 1,
                Ok((_, Ok(Evaluation::Warned))) => report.warned += 1,
                Ok((record, Err(e))) => {
                    report.failed += 1;
                    observability::errors_total().inc();
                    tracing::warn!(
                        record_id = %record.id,
                        owner = %record.owner_id,
                        channel = %record.channel,
                        error = %e,
                        "Watchdog evaluation failed"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    observability::errors_total().inc();
                    tracing::error!(error = %e, "Watchdog task panicked");
                }
            }
        }

        observability::watchdog_ticks().inc();
        report
    }

    async fn evaluate(&self, record: &MonitorRecord, now: DateTime<Utc>) -> Result<Evaluation, ControlError> {
        match record.status {
            MonitorStatus::Running => self.evaluate_running(record, now, None).await,
            MonitorStatus::Paused => {
                let (upstream, _) = self.upstream_state(&record.channel).await;
                if upstream != UpstreamState::Live {
                    return Ok(Evaluation::Quiet);
                }
                self.evaluate_running(record, now, Some(upstream)).await
            }
            MonitorStatus::Stopped => Ok(Evaluation::Quiet),
        }
    }

    /// `upstream` is supplied when already known (a paused record coming back)
    async fn evaluate_running(
        &self,
        record: &MonitorRecord,
        now: DateTime<Utc>,
        upstream: Option<UpstreamState>,
    ) -> Result<Evaluation, ControlError> {
        let observation = self.observe(record, now);
        let thresholds = self.settings.thresholds();

        let stale = observation
            .segment_age
            .is_some_and(|age| age > thresholds.stale_after);
        let upstream = match upstream {
            Some(known) => known,
            None if observation.alive() && !stale => self.upstream_state(&record.channel).await.0,
            None => UpstreamState::Unknown,
        };

        let (cpu_percent, memory_mb) = observation
            .liveness
            .as_ref()
            .filter(|l| l.alive)
            .map_or((0.0, 0.0), |l| (l.cpu_percent, l.memory_mb()));

        let signals = HealthSignals {
            process_alive: observation.alive(),
            in_grace: observation.in_grace,
            segment_age: observation.segment_age,
            upstream,
            cpu_percent,
            memory_mb,
        };

        match decide(&signals, &thresholds) {
            WatchdogAction::Restart(reason) => {
                tracing::warn!(
                    record_id = %record.id,
                    owner = %record.owner_id,
                    channel = %record.channel,
                    pid = ?record.process_handle,
                    zombie = observation.zombie(),
                    ?reason,
                    "Restarting pipeline"
                );
                self.restart_record(record, now).await?;
                Ok(Evaluation::Restarted)
            }
            WatchdogAction::Pause if record.status == MonitorStatus::Running => {
                self.set_status(record, MonitorStatus::Paused).await?;
                observability::pauses().inc();
                tracing::info!(record_id = %record.id, channel = %record.channel, "Upstream offline, monitor paused");
                Ok(Evaluation::Paused)
            }
            WatchdogAction::Pause => Ok(Evaluation::Quiet),
            action if record.status == MonitorStatus::Paused => {
                self.set_status(record, MonitorStatus::Running).await?;
                if let WatchdogAction::Warn(warnings) = action {
                    tracing::warn!(record_id = %record.id, channel = %record.channel, ?warnings, "Pipeline resource warning");
                }
                tracing::info!(record_id = %record.id, channel = %record.channel, "Upstream live again, monitor resumed");
                Ok(Evaluation::Resumed)
            }
            WatchdogAction::Warn(warnings) => {
                tracing::warn!(
                    record_id = %record.id,
                    channel = %record.channel,
                    pid = ?record.process_handle,
                    ?warnings,
                    "Pipeline resource warning"
                );
                Ok(Evaluation::Warned)
            }
            WatchdogAction::None => Ok(Evaluation::Quiet),
        }
    }

    /// Flip status on the freshest copy of the record
    async fn set_status(&self, record: &MonitorRecord, status: MonitorStatus) -> Result<(), ControlError> {
        let Some(mut current) = self.storage.get_monitor(&record.id)? else {
            return Ok(());
        };
        if current.process_handle != record.process_handle {
            // Restarted or adopted since we looked; leave it for the next tick
            return Ok(());
        }
        current.status = status;
        self.storage.update_monitor(&current)?;
        self.after_mutation();
        Ok(())
    }
}
