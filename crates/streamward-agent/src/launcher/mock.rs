//! Launcher that plants pipelines into a [`MockProcessTable`]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{pipeline_script, session_dir, LaunchError, LaunchRequest, Launcher};
use crate::config::PipelineConfig;
use crate::monitor::mock::MockProcessTable;

pub struct MockLauncher {
    table: Arc<MockProcessTable>,
    config: PipelineConfig,
    missing_binary: AtomicBool,
    fail_spawn: AtomicBool,
    launches: Mutex<Vec<(LaunchRequest, u32)>>,
}

impl MockLauncher {
    pub fn new(table: Arc<MockProcessTable>, config: PipelineConfig) -> Self {
        Self {
            table,
            config,
            missing_binary: AtomicBool::new(false),
            fail_spawn: AtomicBool::new(false),
            launches: Mutex::new(Vec::new()),
        }
    }

    pub fn set_missing_binary(&self, missing: bool) {
        self.missing_binary.store(missing, Ordering::SeqCst);
    }

    pub fn set_fail_spawn(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    pub fn launches(&self) -> Vec<(LaunchRequest, u32)> {
        self.launches.lock().clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().len()
    }

    /// Plant a pipeline without going through `launch`, as a previous daemon
    /// instance would have left it
    pub fn plant(&self, request: &LaunchRequest) -> u32 {
        let workdir = session_dir(
            &self.config.work_root,
            &request.owner_id,
            &request.channel,
            &request.session_id,
        );
        let _ = std::fs::create_dir_all(&workdir);

        let capture = &self.config.capture_binary;
        let segmenter = &self.config.segmenter_binary;
        let script = pipeline_script(&self.config, capture, segmenter, &request.channel, &workdir);
        let url = self
            .config
            .channel_url_template
            .replace("{channel}", &request.channel);

        let root = self.table.spawn("sh", &format!("/bin/sh -c {script}"), None);
        self.table.spawn(
            capture,
            &format!("{capture} {url} {} --stdout", self.config.quality),
            Some(root),
        );
        self.table.spawn(
            segmenter,
            &format!(
                "{segmenter} -i pipe:0 -c copy -f segment {}",
                workdir.join("seg_%Y%m%d_%H%M%S.ts").display()
            ),
            Some(root),
        );
        root
    }
}

impl Launcher for MockLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<u32, LaunchError> {
        if self.missing_binary.load(Ordering::SeqCst) {
            return Err(LaunchError::MissingBinary {
                binary: self.config.capture_binary.clone(),
                reason: "cannot find binary path".to_string(),
            });
        }
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(LaunchError::Spawn(std::io::Error::other("fork failed")));
        }
        let pid = self.plant(request);
        self.launches.lock().push((request.clone(), pid));
        Ok(pid)
    }
}
