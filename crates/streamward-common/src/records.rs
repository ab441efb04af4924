//! Monitor records, process observations and derived health
//!
//! `MonitorRecord` is the durable unit of desired state. Everything else in
//! this module is computed on demand and never persisted.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identifier of a monitor record, also used as the capture session id
pub type MonitorId = Uuid;

/// Error returned when a stored or supplied enum value is not recognised
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Lifecycle state of a monitor record
///
/// `Stopped` is terminal. Stopped records are deleted, so it only shows up
/// transiently while a record is on its way out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStatus {
    Running,
    Paused,
    Stopped,
}

impl MonitorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorStatus::Running => "running",
            MonitorStatus::Paused => "paused",
            MonitorStatus::Stopped => "stopped",
        }
    }

    /// Whether a record in this state carries a process handle
    pub fn holds_handle(&self) -> bool {
        matches!(self, MonitorStatus::Running | MonitorStatus::Paused)
    }
}

impl fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MonitorStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(MonitorStatus::Running),
            "paused" => Ok(MonitorStatus::Paused),
            "stopped" => Ok(MonitorStatus::Stopped),
            other => Err(UnknownVariant {
                kind: "monitor status",
                value: other.to_string(),
            }),
        }
    }
}

/// Account tier of the principal issuing control-plane requests
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OwnerTier {
    /// May run any number of monitors
    Privileged,
    /// One active monitor
    #[default]
    Standard,
    /// One active monitor, usage metered from `session_started_at`
    Limited,
}

impl FromStr for OwnerTier {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "privileged" | "admin" => Ok(OwnerTier::Privileged),
            "standard" | "" => Ok(OwnerTier::Standard),
            "limited" => Ok(OwnerTier::Limited),
            other => Err(UnknownVariant {
                kind: "owner tier",
                value: other.to_string(),
            }),
        }
    }
}

/// The caller on whose behalf a control-plane operation runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub owner_id: String,
    pub tier: OwnerTier,
}

impl Principal {
    pub fn new(owner_id: impl Into<String>, tier: OwnerTier) -> Self {
        Self {
            owner_id: owner_id.into(),
            tier,
        }
    }

    pub fn is_privileged(&self) -> bool {
        self.tier == OwnerTier::Privileged
    }

    pub fn is_usage_limited(&self) -> bool {
        self.tier == OwnerTier::Limited
    }
}

/// Durable desired state for one captured channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorRecord {
    pub id: MonitorId,
    pub owner_id: String,
    pub is_privileged: bool,
    /// Normalised lowercase channel identifier
    pub channel: String,
    /// OS pid of the supervised pipeline
    pub process_handle: Option<u32>,
    pub status: MonitorStatus,
    pub started_at: DateTime<Utc>,
    /// Only set for usage-limited owners; consumed by billing
    pub session_started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub restarted_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
}

impl MonitorRecord {
    /// Create a running record for a freshly launched pipeline
    pub fn new(id: MonitorId, principal: &Principal, channel: impl Into<String>, pid: u32) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner_id: principal.owner_id.clone(),
            is_privileged: principal.is_privileged(),
            channel: channel.into(),
            process_handle: Some(pid),
            status: MonitorStatus::Running,
            started_at: now,
            session_started_at: principal.is_usage_limited().then_some(now),
            stopped_at: None,
            restarted_at: None,
            restart_count: 0,
        }
    }

    /// Whether the record is `running` or `paused`
    pub fn is_active(&self) -> bool {
        self.status.holds_handle()
    }

    /// Time of the most recent launch of the pipeline
    pub fn last_launch_at(&self) -> DateTime<Utc> {
        self.restarted_at.unwrap_or(self.started_at)
    }

    /// Time since the most recent launch; zero if `now` is earlier
    pub fn launch_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_launch_at()).to_std().unwrap_or(Duration::ZERO)
    }

    /// A record inside its grace period is never declared dead
    pub fn in_grace_period(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.launch_age(now) < grace
    }

    /// Point the record at a new pipeline after a restart
    pub fn record_restart(&mut self, pid: u32, now: DateTime<Utc>) {
        self.process_handle = Some(pid);
        self.status = MonitorStatus::Running;
        self.restart_count = self.restart_count.saturating_add(1);
        self.restarted_at = Some(now);
    }

    /// Reset the record in place for a new start request
    pub fn relaunch(&mut self, principal: &Principal, pid: u32, now: DateTime<Utc>) {
        self.is_privileged = principal.is_privileged();
        self.process_handle = Some(pid);
        self.status = MonitorStatus::Running;
        self.started_at = now;
        self.session_started_at = principal.is_usage_limited().then_some(now);
        self.stopped_at = None;
        self.restarted_at = None;
        self.restart_count = 0;
    }

    /// Terminal transition; drops the handle
    pub fn mark_stopped(&mut self, now: DateTime<Utc>) {
        self.status = MonitorStatus::Stopped;
        self.process_handle = None;
        self.stopped_at = Some(now);
    }
}

/// A process as seen in the OS process table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Operating system process ID
    pub pid: u32,
    /// Parent process ID
    pub ppid: Option<u32>,
    /// Process name (executable name)
    pub name: String,
    /// Full command line
    pub cmdline: Option<String>,
    /// Process start time
    pub start_time: DateTime<Utc>,
}

impl ProcessInfo {
    pub fn new(pid: u32, name: String) -> Self {
        Self {
            pid,
            ppid: None,
            name,
            cmdline: None,
            start_time: Utc::now(),
        }
    }
}

/// Liveness and resource usage of one process and its descendants
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Liveness {
    pub pid: u32,
    /// Running and not a zombie
    pub alive: bool,
    /// Exited but not yet reaped
    pub zombie: bool,
    /// CPU usage summed over the process and live descendants (100 = one core)
    pub cpu_percent: f32,
    /// Resident memory summed over the process and live descendants
    pub rss_bytes: u64,
    /// Live descendant pids
    pub children: Vec<u32>,
    /// When the process started, if the platform reports it
    pub started_at: Option<DateTime<Utc>>,
}

impl Liveness {
    pub fn memory_mb(&self) -> f64 {
        self.rss_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Upstream stream state as reported by the status provider
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamState {
    Live,
    Offline,
    /// Provider failed, timed out or is not configured
    Unknown,
}

impl UpstreamState {
    pub fn from_live(is_live: bool) -> Self {
        if is_live {
            UpstreamState::Live
        } else {
            UpstreamState::Offline
        }
    }

    pub fn as_option(&self) -> Option<bool> {
        match self {
            UpstreamState::Live => Some(true),
            UpstreamState::Offline => Some(false),
            UpstreamState::Unknown => None,
        }
    }
}

/// Health of one channel's monitor, computed on demand
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSnapshot {
    pub channel: String,
    /// A `running` or `paused` record exists
    pub active: bool,
    pub status: Option<MonitorStatus>,
    pub process_handle: Option<u32>,
    pub process_alive: bool,
    /// `None` when the upstream state is unknown
    pub is_upstream_live: Option<bool>,
    pub viewer_count: Option<u64>,
    pub cpu_percent_aggregate: f32,
    pub memory_mb: f64,
    /// Seconds since the most recent launch
    pub uptime_secs: Option<u64>,
    pub restart_count: u32,
    /// Seconds since the working directory last changed
    pub last_segment_age_secs: Option<u64>,
    pub warnings: Vec<String>,
}

impl HealthSnapshot {
    /// Snapshot for a channel with no active monitor
    pub fn inactive(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            active: false,
            status: None,
            process_handle: None,
            process_alive: false,
            is_upstream_live: None,
            viewer_count: None,
            cpu_percent_aggregate: 0.0,
            memory_mb: 0.0,
            uptime_secs: None,
            restart_count: 0,
            last_segment_age_secs: None,
            warnings: Vec::new(),
        }
    }
}
