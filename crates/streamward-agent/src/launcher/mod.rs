//! Capture pipeline launcher
//!
//! The pipeline is a single `/bin/sh -c` invocation: the capture program
//! writes the stream to stdout and the segmenter cuts it into timestamped
//! `.ts` files inside the session working directory. The shell becomes the
//! leader of a fresh session, so its pid addresses the whole pipeline as a
//! process group and signals aimed at the daemon never reach it.

#[cfg(test)]
pub mod mock;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;
use uuid::Uuid;

use crate::config::PipelineConfig;

/// Everything needed to start one pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Record id, used as the working directory name
    pub session_id: Uuid,
    pub owner_id: String,
    pub channel: String,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{binary} not found: {reason}")]
    MissingBinary { binary: String, reason: String },

    #[error("Failed to prepare {}: {source}", .path.display())]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn pipeline: {0}")]
    Spawn(#[source] std::io::Error),
}

impl LaunchError {
    /// Configuration errors are never retried
    pub fn is_configuration(&self) -> bool {
        matches!(self, LaunchError::MissingBinary { .. })
    }
}

/// Starts capture pipelines and returns their pid
pub trait Launcher: Send + Sync {
    fn launch(&self, request: &LaunchRequest) -> Result<u32, LaunchError>;
}

/// Owner ids end up in paths; anything but `[A-Za-z0-9._-]` becomes `_`
pub fn path_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// `<work_root>/<owner>/<channel>/<session_id>`
pub fn session_dir(work_root: &Path, owner_id: &str, channel: &str, session_id: &Uuid) -> PathBuf {
    work_root
        .join(path_component(owner_id))
        .join(channel)
        .join(session_id.to_string())
}

/// `<log_dir>/<owner>_<channel>.log`
pub fn log_path(log_dir: &Path, owner_id: &str, channel: &str) -> PathBuf {
    log_dir.join(format!("{}_{}.log", path_component(owner_id), channel))
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Shell script for one pipeline
pub fn pipeline_script(
    config: &PipelineConfig,
    capture: &str,
    segmenter: &str,
    channel: &str,
    workdir: &Path,
) -> String {
    let url = config.channel_url_template.replace("{channel}", channel);
    let output = workdir.join(format!("{channel}_%Y%m%d_%H%M%S.ts"));

    let mut capture_cmd = vec![
        shell_quote(capture),
        shell_quote(&url),
        shell_quote(&config.quality),
        "--stdout".to_string(),
    ];
    capture_cmd.extend(config.capture_args.iter().map(|arg| shell_quote(arg)));

    let segment_cmd = [
        shell_quote(segmenter),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "warning".to_string(),
        "-i".to_string(),
        "pipe:0".to_string(),
        "-c".to_string(),
        "copy".to_string(),
        "-f".to_string(),
        "segment".to_string(),
        "-segment_time".to_string(),
        config.segment_seconds.to_string(),
        "-reset_timestamps".to_string(),
        "1".to_string(),
        "-strftime".to_string(),
        "1".to_string(),
        shell_quote(&output.to_string_lossy()),
    ];

    format!(
        "exec {} | exec {}",
        capture_cmd.join(" "),
        segment_cmd.join(" ")
    )
}

/// Launches real pipelines with `/bin/sh`
pub struct PipelineLauncher {
    config: PipelineConfig,
}

impl PipelineLauncher {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    fn resolve(binary: &str) -> Result<PathBuf, LaunchError> {
        which::which(binary).map_err(|e| LaunchError::MissingBinary {
            binary: binary.to_string(),
            reason: e.to_string(),
        })
    }
}

impl Launcher for PipelineLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<u32, LaunchError> {
        let capture = Self::resolve(&self.config.capture_binary)?;
        let segmenter = Self::resolve(&self.config.segmenter_binary)?;

        let workdir = session_dir(
            &self.config.work_root,
            &request.owner_id,
            &request.channel,
            &request.session_id,
        );
        std::fs::create_dir_all(&workdir).map_err(|source| LaunchError::Prepare {
            path: workdir.clone(),
            source,
        })?;
        std::fs::create_dir_all(&self.config.log_dir).map_err(|source| LaunchError::Prepare {
            path: self.config.log_dir.clone(),
            source,
        })?;

        let log = log_path(&self.config.log_dir, &request.owner_id, &request.channel);
        let prepare_log = |source| LaunchError::Prepare {
            path: log.clone(),
            source,
        };
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log)
            .map_err(prepare_log)?;
        let stderr = stdout.try_clone().map_err(prepare_log)?;

        let script = pipeline_script(
            &self.config,
            &capture.to_string_lossy(),
            &segmenter.to_string_lossy(),
            &request.channel,
            &workdir,
        );

        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(&script)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // SAFETY: setsid is async-signal-safe and touches no shared state
            unsafe {
                command.pre_exec(|| {
                    nix::unistd::setsid()
                        .map(|_| ())
                        .map_err(std::io::Error::from)
                });
            }
        }

        let child = command.spawn().map_err(LaunchError::Spawn)?;
        let pid = child.id();
        // Not waited on: the supervisor tracks the pid and reaps it
        drop(child);

        tracing::info!(
            pid,
            owner = %request.owner_id,
            channel = %request.channel,
            session = %request.session_id,
            "Launched capture pipeline"
        );
        Ok(pid)
    }
}
