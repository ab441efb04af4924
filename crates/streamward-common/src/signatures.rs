//! Capture pipeline signature matching
//!
//! A capture pipeline shows up in the process table as a shell root whose
//! command line carries the capture program, the channel URL and the
//! segmenter's output path, plus the two pipeline stages underneath it. The
//! reconciler uses [`PipelineSignature`] to find those roots again after a
//! daemon restart, and to spot segmenters that outlived their pipeline.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::records::ProcessInfo;

/// Placeholder for the channel inside a URL template
pub const CHANNEL_PLACEHOLDER: &str = "{channel}";

/// Errors that can occur while building a signature
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("Invalid regex pattern: {0}")]
    InvalidRegex(#[from] regex::Error),

    #[error("URL template has no {{channel}} placeholder: {0}")]
    MissingPlaceholder(String),

    #[error("Program name is empty")]
    EmptyProgram,
}

/// A pipeline root found in the process table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPipeline {
    pub pid: u32,
    pub ppid: Option<u32>,
    /// Lowercased channel extracted from the capture URL
    pub channel: String,
    /// Owner path component of the working directory, when visible
    pub owner: Option<String>,
    /// Session id of the working directory, when visible
    pub session: Option<Uuid>,
    pub start_time: DateTime<Utc>,
}

/// Working directory coordinates parsed from a segmenter output path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkdirRef {
    pub owner: String,
    pub channel: String,
    pub session: Uuid,
}

/// Compiled matcher for the capture pipeline command line
#[derive(Debug, Clone)]
pub struct PipelineSignature {
    capture_program: String,
    segmenter_program: String,
    channel_url: Regex,
    workdir: Regex,
}

impl PipelineSignature {
    /// Compile a signature
    ///
    /// `capture_program` and `segmenter_program` may be bare names or paths;
    /// only the file name takes part in matching.
    pub fn new(
        capture_program: &str,
        segmenter_program: &str,
        channel_url_template: &str,
        work_root: &Path,
    ) -> Result<Self, SignatureError> {
        let capture_program = program_name(capture_program).ok_or(SignatureError::EmptyProgram)?;
        let segmenter_program =
            program_name(segmenter_program).ok_or(SignatureError::EmptyProgram)?;

        if !channel_url_template.contains(CHANNEL_PLACEHOLDER) {
            return Err(SignatureError::MissingPlaceholder(
                channel_url_template.to_string(),
            ));
        }
        let escaped = regex::escape(channel_url_template)
            .replace(&regex::escape(CHANNEL_PLACEHOLDER), "([A-Za-z0-9_]+)");
        // Scheme and www prefix vary between launcher versions
        let escaped = escaped
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_start_matches(r"www\.")
            .to_string();
        let channel_url = Regex::new(&format!(r"(?i)(?:https?://)?(?:www\.)?{escaped}\b"))?;

        let work_root = work_root.to_string_lossy().trim_end_matches('/').to_string();
        let workdir = Regex::new(&format!(
            r"{}/([^/\s'\x22]+)/([^/\s'\x22]+)/([0-9a-fA-F]{{8}}-[0-9a-fA-F]{{4}}-[0-9a-fA-F]{{4}}-[0-9a-fA-F]{{4}}-[0-9a-fA-F]{{12}})",
            regex::escape(&work_root)
        ))?;

        Ok(Self {
            capture_program,
            segmenter_program,
            channel_url,
            workdir,
        })
    }

    /// Channel captured by this process, if it belongs to a capture pipeline
    pub fn match_capture(&self, process: &ProcessInfo) -> Option<String> {
        let cmdline = process.cmdline.as_deref()?;
        if !cmdline.contains(&self.capture_program) {
            return None;
        }
        self.channel_url
            .captures(cmdline)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_ascii_lowercase())
    }

    /// Working directory referenced by a command line
    pub fn workdir_of(&self, cmdline: &str) -> Option<WorkdirRef> {
        let caps = self.workdir.captures(cmdline)?;
        let session = Uuid::parse_str(caps.get(3)?.as_str()).ok()?;
        Some(WorkdirRef {
            owner: caps.get(1)?.as_str().to_string(),
            channel: caps.get(2)?.as_str().to_ascii_lowercase(),
            session,
        })
    }

    /// Whether the process is a segmenter writing under the work root
    pub fn is_segmenter(&self, process: &ProcessInfo) -> bool {
        let Some(cmdline) = process.cmdline.as_deref() else {
            return false;
        };
        let runs_segmenter = process.name == self.segmenter_program
            || cmdline
                .split_whitespace()
                .next()
                .and_then(program_name)
                .is_some_and(|name| name == self.segmenter_program);
        runs_segmenter && self.workdir.is_match(cmdline)
    }

    /// Pipeline roots: matching processes whose parent does not also match
    pub fn discover(&self, processes: &[ProcessInfo]) -> Vec<DiscoveredPipeline> {
        let matching: Vec<(&ProcessInfo, String)> = processes
            .iter()
            .filter_map(|p| self.match_capture(p).map(|channel| (p, channel)))
            .collect();
        let matching_pids: HashSet<u32> = matching.iter().map(|(p, _)| p.pid).collect();

        matching
            .into_iter()
            .filter(|(p, _)| !p.ppid.is_some_and(|ppid| matching_pids.contains(&ppid)))
            .map(|(p, channel)| {
                let workdir = p.cmdline.as_deref().and_then(|c| self.workdir_of(c));
                DiscoveredPipeline {
                    pid: p.pid,
                    ppid: p.ppid,
                    channel,
                    owner: workdir.as_ref().map(|w| w.owner.clone()),
                    session: workdir.map(|w| w.session),
                    start_time: p.start_time,
                }
            })
            .collect()
    }
}

fn program_name(program: &str) -> Option<String> {
    Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
}
