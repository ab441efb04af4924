//! Agent configuration
//!
//! Loaded from TOML (`$STREAMWARD_CONFIG`, else `agent.toml` in the platform
//! config directory) and then overridden by `STREAMWARD_*` environment
//! variables. Every field has a default, so an empty file is valid.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Top-level agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub watchdog: WatchdogConfig,

    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the HTTP control plane
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Log level used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// TTL of the read-through cache for monitor listings; health is
    /// always computed live
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            log_level: default_log_level(),
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file path (None for in-memory)
    #[serde(default = "default_db_path")]
    pub db_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Network capture program, bare name or absolute path
    #[serde(default = "default_capture_binary")]
    pub capture_binary: String,

    /// Segmenter program, bare name or absolute path
    #[serde(default = "default_segmenter_binary")]
    pub segmenter_binary: String,

    /// Channel URL; `{channel}` is substituted
    #[serde(default = "default_channel_url_template")]
    pub channel_url_template: String,

    #[serde(default = "default_quality")]
    pub quality: String,

    /// Extra capture flags (ad stripping and the like)
    #[serde(default = "default_capture_args")]
    pub capture_args: Vec<String>,

    /// Length of each segment
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u32,

    /// Root of per-session working directories
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,

    /// Directory for per-pipeline log files
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capture_binary: default_capture_binary(),
            segmenter_binary: default_segmenter_binary(),
            channel_url_template: default_channel_url_template(),
            quality: default_quality(),
            capture_args: default_capture_args(),
            segment_seconds: default_segment_seconds(),
            work_root: default_work_root(),
            log_dir: default_log_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_watchdog_interval")]
    pub interval_secs: u64,

    /// Startup grace period; younger records are never declared dead
    #[serde(default = "default_grace")]
    pub grace_period_secs: u64,

    /// Segment inactivity that triggers a restart
    #[serde(default = "default_stale")]
    pub stale_after_secs: u64,

    /// Aggregate CPU warning threshold (100 = one core)
    #[serde(default = "default_cpu_warn")]
    pub cpu_warn_percent: f32,

    #[serde(default = "default_memory_warn")]
    pub memory_warn_mb: f64,

    /// Wait between SIGTERM and SIGKILL
    #[serde(default = "default_terminate_timeout")]
    pub terminate_timeout_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_watchdog_interval(),
            grace_period_secs: default_grace(),
            stale_after_secs: default_stale(),
            cpu_warn_percent: default_cpu_warn(),
            memory_warn_mb: default_memory_warn(),
            terminate_timeout_secs: default_terminate_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_reconciler_interval")]
    pub interval_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconciler_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the channel status service; unset disables the signal
    #[serde(default)]
    pub status_url: Option<String>,

    #[serde(default)]
    pub bearer_token: Option<String>,

    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            status_url: None,
            bearer_token: None,
            client_id: None,
            timeout_secs: default_upstream_timeout(),
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "streamward", "streamward")
}

fn data_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("streamward"))
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8640))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cache_ttl() -> u64 {
    5
}

fn default_db_path() -> Option<PathBuf> {
    Some(data_dir().join("monitors.db"))
}

fn default_capture_binary() -> String {
    "streamlink".to_string()
}

fn default_segmenter_binary() -> String {
    "ffmpeg".to_string()
}

fn default_channel_url_template() -> String {
    "https://twitch.tv/{channel}".to_string()
}

fn default_quality() -> String {
    "best".to_string()
}

fn default_capture_args() -> Vec<String> {
    vec!["--twitch-disable-ads".to_string()]
}

fn default_segment_seconds() -> u32 {
    60
}

fn default_work_root() -> PathBuf {
    data_dir().join("work")
}

fn default_log_dir() -> PathBuf {
    data_dir().join("logs")
}

fn default_watchdog_interval() -> u64 {
    30
}

fn default_grace() -> u64 {
    30
}

fn default_stale() -> u64 {
    120
}

fn default_cpu_warn() -> f32 {
    150.0
}

fn default_memory_warn() -> f64 {
    2048.0
}

fn default_terminate_timeout() -> u64 {
    5
}

fn default_reconciler_interval() -> u64 {
    60
}

fn default_upstream_timeout() -> u64 {
    5
}

impl AgentConfig {
    /// Load config from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_str(&contents)
    }

    /// Parse config from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> anyhow::Result<Self> {
        let config: AgentConfig = toml::from_str(contents).context("Invalid agent config")?;
        Ok(config)
    }

    /// Load from the configured file, if any, then apply environment overrides
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var_os("STREAMWARD_CONFIG")
            .map(PathBuf::from)
            .or_else(|| {
                project_dirs()
                    .map(|dirs| dirs.config_dir().join("agent.toml"))
                    .filter(|p| p.exists())
            });

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `STREAMWARD_*` overrides; unparsable values are ignored
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("STREAMWARD_LISTEN_ADDR") {
            match addr.parse() {
                Ok(parsed) => self.server.listen_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Ignoring invalid STREAMWARD_LISTEN_ADDR"),
            }
        }

        if let Some(level) = lookup("STREAMWARD_LOG_LEVEL") {
            self.server.log_level = level;
        }

        if let Some(path) = lookup("STREAMWARD_DB_PATH") {
            self.storage.db_path = match path.as_str() {
                "" | ":memory:" => None,
                _ => Some(PathBuf::from(path)),
            };
        }

        if let Some(path) = lookup("STREAMWARD_WORK_ROOT") {
            self.pipeline.work_root = PathBuf::from(path);
        }

        if let Some(path) = lookup("STREAMWARD_LOG_DIR") {
            self.pipeline.log_dir = PathBuf::from(path);
        }

        if let Some(url) = lookup("STREAMWARD_STATUS_URL") {
            self.upstream.status_url = Some(url).filter(|u| !u.is_empty());
        }

        if let Some(token) = lookup("STREAMWARD_STATUS_TOKEN") {
            self.upstream.bearer_token = Some(token).filter(|t| !t.is_empty());
        }
    }

    /// Example configuration file
    pub fn example_toml() -> &'static str {
        r#"# streamward agent configuration

[server]
listen_addr = "127.0.0.1:8640"
log_level = "info"
cache_ttl_secs = 5

[storage]
db_path = "/var/lib/streamward/monitors.db"

[pipeline]
capture_binary = "streamlink"
segmenter_binary = "ffmpeg"
channel_url_template = "https://twitch.tv/{channel}"
quality = "best"
capture_args = ["--twitch-disable-ads"]
segment_seconds = 60
work_root = "/var/lib/streamward/work"
log_dir = "/var/log/streamward"

[watchdog]
interval_secs = 30
grace_period_secs = 30
stale_after_secs = 120
cpu_warn_percent = 150.0
memory_warn_mb = 2048.0
terminate_timeout_secs = 5

[reconciler]
interval_secs = 60

[upstream]
# status_url = "https://status.example.com/channels"
# bearer_token = "..."
# client_id = "..."
timeout_secs = 5
"#
    }
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}
