//! In-memory process table for tests
//!
//! Signalled processes turn into zombies (as a real child of the daemon
//! would) until reaped. Every signal and reap is recorded for assertions.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;
use streamward_common::{Liveness, PlatformResult, ProcessInfo, ProcessTable, TermSignal};

#[derive(Debug, Clone)]
struct MockProcess {
    info: ProcessInfo,
    zombie: bool,
    ignores_term: bool,
    cpu_percent: f32,
    rss_bytes: u64,
}

#[derive(Default)]
struct MockState {
    processes: HashMap<u32, MockProcess>,
    signals: Vec<(u32, TermSignal)>,
    reaped: Vec<u32>,
    next_pid: u32,
}

impl MockState {
    fn descendants(&self, pid: u32) -> Vec<u32> {
        let mut found = Vec::new();
        let mut frontier = vec![pid];
        while let Some(current) = frontier.pop() {
            for (child, proc) in &self.processes {
                if proc.info.ppid == Some(current) && !found.contains(child) && *child != pid {
                    found.push(*child);
                    frontier.push(*child);
                }
            }
        }
        found
    }
}

pub struct MockProcessTable {
    state: Mutex<MockState>,
}

impl MockProcessTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_pid: 1000,
                ..Default::default()
            }),
        }
    }

    /// Add a live process with the next free pid
    pub fn spawn(&self, name: &str, cmdline: &str, ppid: Option<u32>) -> u32 {
        let mut state = self.state.lock();
        state.next_pid += 1;
        let pid = state.next_pid;
        let mut info = ProcessInfo::new(pid, name.to_string());
        info.ppid = ppid.or(Some(1));
        info.cmdline = Some(cmdline.to_string());
        info.start_time = Utc::now();
        state.processes.insert(
            pid,
            MockProcess {
                info,
                zombie: false,
                ignores_term: false,
                cpu_percent: 1.0,
                rss_bytes: 16 * 1024 * 1024,
            },
        );
        pid
    }

    /// Process exits on its own and waits to be reaped
    pub fn exit(&self, pid: u32) {
        if let Some(proc) = self.state.lock().processes.get_mut(&pid) {
            proc.zombie = true;
        }
    }

    /// Process and its descendants disappear without a trace
    pub fn vanish(&self, pid: u32) {
        let mut state = self.state.lock();
        for child in state.descendants(pid) {
            state.processes.remove(&child);
        }
        state.processes.remove(&pid);
    }

    pub fn set_ignores_term(&self, pid: u32, ignores: bool) {
        if let Some(proc) = self.state.lock().processes.get_mut(&pid) {
            proc.ignores_term = ignores;
        }
    }

    pub fn set_usage(&self, pid: u32, cpu_percent: f32, rss_bytes: u64) {
        if let Some(proc) = self.state.lock().processes.get_mut(&pid) {
            proc.cpu_percent = cpu_percent;
            proc.rss_bytes = rss_bytes;
        }
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.state
            .lock()
            .processes
            .get(&pid)
            .is_some_and(|proc| !proc.zombie)
    }

    pub fn signals(&self) -> Vec<(u32, TermSignal)> {
        self.state.lock().signals.clone()
    }

    pub fn signalled(&self, pid: u32) -> bool {
        self.state.lock().signals.iter().any(|(p, _)| *p == pid)
    }

    pub fn reaped(&self) -> Vec<u32> {
        self.state.lock().reaped.clone()
    }

    pub fn live_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .state
            .lock()
            .processes
            .iter()
            .filter(|(_, proc)| !proc.zombie)
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_unstable();
        pids
    }
}

impl ProcessTable for MockProcessTable {
    fn snapshot(&self) -> PlatformResult<Vec<ProcessInfo>> {
        Ok(self
            .state
            .lock()
            .processes
            .values()
            .map(|proc| proc.info.clone())
            .collect())
    }

    fn inspect(&self, pid: u32) -> Option<Liveness> {
        let state = self.state.lock();
        let root = state.processes.get(&pid)?;
        let children: Vec<u32> = state
            .descendants(pid)
            .into_iter()
            .filter(|child| state.processes.get(child).is_some_and(|p| !p.zombie))
            .collect();

        let (mut cpu_percent, mut rss_bytes) = if root.zombie {
            (0.0, 0)
        } else {
            (root.cpu_percent, root.rss_bytes)
        };
        for child in &children {
            if let Some(proc) = state.processes.get(child) {
                cpu_percent += proc.cpu_percent;
                rss_bytes += proc.rss_bytes;
            }
        }

        Some(Liveness {
            pid,
            alive: !root.zombie,
            zombie: root.zombie,
            cpu_percent,
            rss_bytes,
            children,
            started_at: Some(root.info.start_time),
        })
    }

    fn signal(&self, pid: u32, signal: TermSignal) -> PlatformResult<()> {
        let mut state = self.state.lock();
        state.signals.push((pid, signal));

        let ignores = match state.processes.get(&pid) {
            Some(proc) => proc.ignores_term && signal == TermSignal::Graceful,
            None => return Ok(()),
        };
        if ignores {
            return Ok(());
        }
        // Group delivery: the pipeline stages die with the root
        for child in state.descendants(pid) {
            state.processes.remove(&child);
        }
        if let Some(proc) = state.processes.get_mut(&pid) {
            proc.zombie = true;
        }
        Ok(())
    }

    fn reap(&self, pid: u32) -> bool {
        let mut state = self.state.lock();
        if state.processes.get(&pid).is_some_and(|proc| proc.zombie) {
            state.processes.remove(&pid);
            state.reaped.push(pid);
            true
        } else {
            false
        }
    }
}
