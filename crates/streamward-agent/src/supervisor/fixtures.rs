//! Shared test harness: a supervisor wired to in-memory fakes

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use streamward_common::{MonitorRecord, OwnerTier, Principal};
use tempfile::TempDir;

use super::{Supervisor, SupervisorSettings};
use crate::config::PipelineConfig;
use crate::launcher::mock::MockLauncher;
use crate::launcher::LaunchRequest;
use crate::monitor::mock::MockProcessTable;
use crate::storage::Storage;
use crate::upstream::{ChannelStatus, DisabledStatusProvider, MockStatusProvider, StatusProvider};

pub struct TestHarness {
    pub supervisor: Arc<Supervisor>,
    pub table: Arc<MockProcessTable>,
    pub launcher: Arc<MockLauncher>,
    pub storage: Storage,
    _dir: TempDir,
}

impl TestHarness {
    /// Upstream status disabled
    pub fn new() -> Self {
        Self::with_upstream(Arc::new(DisabledStatusProvider))
    }

    /// Upstream always reports `live`
    pub fn with_live(live: bool) -> Self {
        let mut upstream = MockStatusProvider::new();
        upstream.expect_channel_status().returning(move |_| {
            Ok(ChannelStatus {
                is_live: live,
                viewer_count: Some(42),
                ..Default::default()
            })
        });
        Self::with_upstream(Arc::new(upstream))
    }

    pub fn with_upstream(upstream: Arc<dyn StatusProvider>) -> Self {
        Self::build(upstream, Duration::ZERO)
    }

    /// Upstream disabled, listings cached for `ttl`
    pub fn with_cache_ttl(ttl: Duration) -> Self {
        Self::build(Arc::new(DisabledStatusProvider), ttl)
    }

    fn build(upstream: Arc<dyn StatusProvider>, cache_ttl: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = PipelineConfig {
            capture_binary: "streamlink".to_string(),
            segmenter_binary: "ffmpeg".to_string(),
            channel_url_template: "https://twitch.tv/{channel}".to_string(),
            work_root: dir.path().join("work"),
            log_dir: dir.path().join("logs"),
            ..Default::default()
        };

        let table = Arc::new(MockProcessTable::new());
        let launcher = Arc::new(MockLauncher::new(Arc::clone(&table), pipeline.clone()));
        let storage = Storage::in_memory().unwrap();

        let settings = SupervisorSettings {
            grace_period: Duration::from_secs(30),
            stale_after: Duration::from_secs(120),
            cpu_warn_percent: 150.0,
            memory_warn_mb: 2048.0,
            terminate_timeout: Duration::from_millis(300),
            upstream_timeout: Duration::from_millis(500),
            cache_ttl,
            pipeline,
        };

        let supervisor = Supervisor::new(
            storage.clone(),
            Arc::clone(&table) as _,
            Arc::clone(&launcher) as _,
            upstream,
            settings,
        )
        .unwrap();

        Self {
            supervisor: Arc::new(supervisor),
            table,
            launcher,
            storage,
            _dir: dir,
        }
    }

    /// Plant a pipeline outside the supervisor, as a crashed daemon would leave it
    pub fn plant(&self, owner_id: &str, channel: &str, session_id: uuid::Uuid) -> u32 {
        self.launcher.plant(&LaunchRequest {
            session_id,
            owner_id: owner_id.to_string(),
            channel: channel.to_string(),
        })
    }

    pub fn record(&self, id: &uuid::Uuid) -> Option<MonitorRecord> {
        self.storage.get_monitor(id).unwrap()
    }

    pub fn records(&self) -> Vec<MonitorRecord> {
        self.storage.all_monitors().unwrap()
    }
}

pub fn standard(owner_id: &str) -> Principal {
    Principal::new(owner_id, OwnerTier::Standard)
}

pub fn privileged(owner_id: &str) -> Principal {
    Principal::new(owner_id, OwnerTier::Privileged)
}

/// A moment past the default grace period
pub fn after_grace() -> DateTime<Utc> {
    Utc::now() + chrono::Duration::seconds(31)
}
