//! Sysinfo-backed process table
//!
//! sysinfo provides listing and resource figures; signals and reaping go
//! through nix. CPU usage is a delta between refreshes, so the `System`
//! instance is kept for the daemon's lifetime.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use streamward_common::{
    Liveness, PlatformError, PlatformResult, ProcessInfo, ProcessTable, TermSignal,
};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};

/// Full refreshes closer together than this reuse the previous one
const FULL_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

struct TableState {
    system: System,
    last_full_refresh: Option<Instant>,
}

/// Process table using the sysinfo crate
pub struct SysinfoProcessTable {
    state: Mutex<TableState>,
}

impl SysinfoProcessTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                system: System::new(),
                last_full_refresh: None,
            }),
        }
    }

    fn refresh_kind() -> ProcessRefreshKind {
        ProcessRefreshKind::nothing()
            .with_cpu()
            .with_memory()
            .with_cmd(UpdateKind::OnlyIfNotSet)
    }

    fn refresh_all(state: &mut TableState) {
        state
            .system
            .refresh_processes_specifics(ProcessesToUpdate::All, true, Self::refresh_kind());
        state.last_full_refresh = Some(Instant::now());
    }

    fn refresh_for_inspect(state: &mut TableState, pid: Pid) {
        let fresh = state
            .last_full_refresh
            .is_some_and(|at| at.elapsed() < FULL_REFRESH_INTERVAL);
        if fresh {
            state.system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                true,
                Self::refresh_kind(),
            );
        } else {
            Self::refresh_all(state);
        }
    }

    /// Thread ids reported as processes on Linux
    fn thread_ids(system: &System) -> HashSet<Pid> {
        system
            .processes()
            .iter()
            .filter_map(|(pid, proc)| proc.tasks().map(|tasks| (pid, tasks)))
            .flat_map(|(pid, tasks)| tasks.iter().filter(move |tid| *tid != pid).copied())
            .collect()
    }

    fn convert_process(pid: Pid, proc: &sysinfo::Process) -> ProcessInfo {
        let mut info = ProcessInfo::new(pid.as_u32(), proc.name().to_string_lossy().to_string());
        info.ppid = proc.parent().map(|p| p.as_u32());
        let cmd_parts: Vec<String> = proc
            .cmd()
            .iter()
            .map(|s| s.to_string_lossy().to_string())
            .collect();
        info.cmdline = (!cmd_parts.is_empty()).then(|| cmd_parts.join(" "));
        info.start_time =
            chrono::DateTime::from_timestamp(proc.start_time() as i64, 0).unwrap_or_else(Utc::now);
        info
    }
}

impl Default for SysinfoProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

fn is_zombie(proc: &sysinfo::Process) -> bool {
    matches!(proc.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
}

impl ProcessTable for SysinfoProcessTable {
    fn snapshot(&self) -> PlatformResult<Vec<ProcessInfo>> {
        let mut state = self.state.lock();
        Self::refresh_all(&mut state);

        let threads = Self::thread_ids(&state.system);
        Ok(state
            .system
            .processes()
            .iter()
            .filter(|(pid, _)| !threads.contains(pid))
            .map(|(pid, proc)| Self::convert_process(*pid, proc))
            .collect())
    }

    fn inspect(&self, pid: u32) -> Option<Liveness> {
        let target = Pid::from_u32(pid);
        let mut state = self.state.lock();
        Self::refresh_for_inspect(&mut state, target);

        let system = &state.system;
        let root = system.process(target)?;
        let zombie = is_zombie(root);

        let threads = Self::thread_ids(system);
        let mut children_of: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (child, proc) in system.processes() {
            if threads.contains(child) {
                continue;
            }
            if let Some(parent) = proc.parent() {
                children_of.entry(parent).or_default().push(*child);
            }
        }

        let mut cpu_percent = if zombie { 0.0 } else { root.cpu_usage() };
        let mut rss_bytes = if zombie { 0 } else { root.memory() };
        let mut children = Vec::new();
        let mut queue: VecDeque<Pid> = VecDeque::from([target]);
        let mut seen: HashSet<Pid> = HashSet::from([target]);

        while let Some(current) = queue.pop_front() {
            for child in children_of.get(&current).into_iter().flatten() {
                if !seen.insert(*child) {
                    continue;
                }
                queue.push_back(*child);
                if let Some(proc) = system.process(*child) {
                    if !is_zombie(proc) {
                        cpu_percent += proc.cpu_usage();
                        rss_bytes += proc.memory();
                        children.push(child.as_u32());
                    }
                }
            }
        }

        Some(Liveness {
            pid,
            alive: !zombie,
            zombie,
            cpu_percent,
            rss_bytes,
            children,
            started_at: chrono::DateTime::from_timestamp(root.start_time() as i64, 0),
        })
    }

    #[cfg(unix)]
    fn signal(&self, pid: u32, signal: TermSignal) -> PlatformResult<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, killpg, Signal};
        use nix::unistd::Pid as NixPid;

        let raw = i32::try_from(pid).map_err(|_| PlatformError::SignalFailed {
            pid,
            reason: "pid out of range".to_string(),
        })?;
        // 0 and 1 address the caller's group and init
        if raw <= 1 || pid == std::process::id() {
            return Err(PlatformError::PermissionDenied(format!(
                "refusing to signal pid {pid}"
            )));
        }
        let sig = match signal {
            TermSignal::Graceful => Signal::SIGTERM,
            TermSignal::Forced => Signal::SIGKILL,
        };

        match killpg(NixPid::from_raw(raw), sig) {
            Ok(()) => return Ok(()),
            // Not a group leader, or the group is gone
            Err(Errno::ESRCH) | Err(Errno::EPERM) => {}
            Err(e) => {
                tracing::debug!(pid, error = %e, "killpg failed, falling back to kill");
            }
        }

        match kill(NixPid::from_raw(raw), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(Errno::EPERM) => Err(PlatformError::PermissionDenied(format!(
                "{} to pid {pid}",
                signal.name()
            ))),
            Err(e) => Err(PlatformError::SignalFailed {
                pid,
                reason: e.to_string(),
            }),
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, _pid: u32, _signal: TermSignal) -> PlatformResult<()> {
        Err(PlatformError::NotSupported(
            "process signals require a unix host".to_string(),
        ))
    }

    #[cfg(unix)]
    fn reap(&self, pid: u32) -> bool {
        use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
        use nix::unistd::Pid as NixPid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 1 {
            return false;
        }
        // ECHILD: not our child, init reaps it
        match waitpid(NixPid::from_raw(raw), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => false,
            Ok(_) => {
                let mut state = self.state.lock();
                state.system.refresh_processes_specifics(
                    ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
                    true,
                    Self::refresh_kind(),
                );
                true
            }
        }
    }

    #[cfg(not(unix))]
    fn reap(&self, _pid: u32) -> bool {
        false
    }
}
