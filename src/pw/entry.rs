use crate::pw::cgroup::{CgroupHandle, CgroupRoot};
use crate::pw::engine::pw_event;
use anyhow::Context as _;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, setpgid};
use std::fmt;
use std::os::unix::process::CommandExt as _;
use std::process::Command;
use std::time::{Duration, Instant};

/// Lifecycle of one supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Stopped,
    Starting,
    Running,
    Failed,
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryState::Stopped => "stopped",
            EntryState::Starting => "starting",
            EntryState::Running => "running",
            EntryState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One user-declared child process and its restart policy.
///
/// Invariants held by the engine's single-threaded dispatch:
/// - `state == Running` iff `pid > 0`;
/// - the child is made its own process-group leader at spawn, so its pgid
///   equals its pid for its entire lifetime and every signal targets the
///   whole group via the negative pid;
/// - `restarts <= max_restarts` whenever the entry is permitted to run.
#[derive(Debug)]
pub struct SupervisedEntry {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,

    // Restart policy.
    pub max_restarts: u32,
    pub restart_delay: Duration,
    pub backoff_factor: f64,

    // Resource limits (cgroup v2), absent means unlimited.
    pub memory_limit_bytes: Option<u64>,
    pub cpu_quota_percent: Option<u32>,
    pub pids_limit: Option<u32>,

    // Runtime fields, owned by the engine task.
    pub(crate) state: EntryState,
    pub(crate) pid: i32,
    pub(crate) start_time: Instant,
    pub(crate) last_uptime: Duration,
    pub(crate) last_exit_code: i32,
    pub(crate) restarts: u32,
    pub(crate) cgroup: Option<CgroupHandle>,
}

impl SupervisedEntry {
    pub fn new(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            max_restarts: 3,
            restart_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            memory_limit_bytes: None,
            cpu_quota_percent: None,
            pids_limit: None,
            state: EntryState::Stopped,
            pid: 0,
            start_time: Instant::now(),
            last_uptime: Duration::ZERO,
            last_exit_code: 0,
            restarts: 0,
            cgroup: None,
        }
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    /// 0 while not running.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn last_exit_code(&self) -> i32 {
        self.last_exit_code
    }

    /// How long the most recent incarnation ran before it exited.
    pub fn last_uptime(&self) -> Duration {
        self.last_uptime
    }

    /// Forks and execs the child.
    ///
    /// Before exec the child calls `setpgid(0, 0)`, making itself the leader
    /// of a fresh process group. This must happen before the child can fork
    /// grandchildren, otherwise they would escape group signalling and
    /// survive shutdown. Stdout and stderr are inherited from the
    /// supervisor; no other descriptors leak into the child.
    ///
    /// Cgroup limits are applied after the fork, each step best-effort: a
    /// failed limit write is logged and the child keeps running without it.
    pub fn spawn(&mut self, cgroup_root: Option<&CgroupRoot>) -> anyhow::Result<()> {
        self.state = EntryState::Starting;

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        unsafe {
            // setpgid is async-signal-safe and therefore legal between fork
            // and exec.
            cmd.pre_exec(|| {
                setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                Ok(())
            });
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.state = EntryState::Failed;
                self.pid = 0;
                return Err(e).with_context(|| format!("failed to start {}", self.name));
            }
        };

        self.pid = child.id() as i32;
        self.state = EntryState::Running;
        self.start_time = Instant::now();
        // The exit status is collected by the reaper via waitpid(-1); the
        // Child handle is not waited on.
        drop(child);

        if let Some(root) = cgroup_root {
            self.apply_cgroup_limits(root);
        }

        pw_event(
            "spawn",
            Some(&self.name),
            format!("started pid={} pgid={}", self.pid, self.pid),
        );
        Ok(())
    }

    fn apply_cgroup_limits(&mut self, root: &CgroupRoot) {
        if self.memory_limit_bytes.is_none()
            && self.cpu_quota_percent.is_none()
            && self.pids_limit.is_none()
        {
            return;
        }

        let cg = match CgroupHandle::create(root, &self.name) {
            Ok(cg) => cg,
            Err(e) => {
                pw_event(
                    "cgroup",
                    Some(&self.name),
                    format!("warning: failed to create cgroup: {e:#}"),
                );
                return;
            }
        };

        if let Some(bytes) = self.memory_limit_bytes {
            if let Err(e) = cg.set_memory_limit(bytes) {
                pw_event(
                    "cgroup",
                    Some(&self.name),
                    format!("warning: failed to set memory limit: {e:#}"),
                );
            }
        }
        if let Some(percent) = self.cpu_quota_percent {
            if let Err(e) = cg.set_cpu_quota(percent) {
                pw_event(
                    "cgroup",
                    Some(&self.name),
                    format!("warning: failed to set cpu quota: {e:#}"),
                );
            }
        }
        if let Some(max) = self.pids_limit {
            if let Err(e) = cg.set_pids_limit(max) {
                pw_event(
                    "cgroup",
                    Some(&self.name),
                    format!("warning: failed to set pids limit: {e:#}"),
                );
            }
        }

        match cg.attach(self.pid) {
            Ok(()) => {
                pw_event(
                    "cgroup",
                    Some(&self.name),
                    format!(
                        "applied limits (mem={}MB cpu={}% pids={})",
                        self.memory_limit_bytes.map(|b| b / (1024 * 1024)).unwrap_or(0),
                        self.cpu_quota_percent.unwrap_or(0),
                        self.pids_limit.unwrap_or(0),
                    ),
                );
            }
            Err(e) => {
                pw_event(
                    "cgroup",
                    Some(&self.name),
                    format!("warning: failed to attach pid to cgroup: {e:#}"),
                );
            }
        }
        self.cgroup = Some(cg);
    }

    /// Sends `sig` to the child's process group (`kill(-pid, sig)`), reaching
    /// the entire subtree. Never mutates state; state transitions happen only
    /// after reaping.
    pub fn signal(&self, sig: Signal) -> anyhow::Result<()> {
        anyhow::ensure!(self.pid != 0, "{} is not running", self.name);
        kill(Pid::from_raw(-self.pid), sig)
            .with_context(|| format!("send {sig:?} to process group {}", self.pid))
    }

    /// Signal-0 liveness probe on the process group.
    ///
    /// Only legal while this entry holds an unreaped pid: once reaped, the
    /// kernel may recycle the pid and a probe would target a stranger.
    pub fn is_alive(&self) -> bool {
        if self.pid == 0 {
            return false;
        }
        match kill(Pid::from_raw(-self.pid), None) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(e) => {
                pw_event(
                    "signal",
                    Some(&self.name),
                    format!("liveness probe failed: {e}"),
                );
                true
            }
        }
    }

    /// Records an exit observed by the reaper.
    ///
    /// `exit_code` is the raw code for a normal exit, or `128 + signal` for a
    /// signal death (shell convention). The pid is cleared immediately so a
    /// later spurious signal can never target a recycled pid.
    pub fn mark_exited(&mut self, exit_code: i32, runtime: Duration) {
        self.state = EntryState::Stopped;
        self.last_uptime = runtime;
        self.last_exit_code = exit_code;
        self.pid = 0;
    }

    /// Returns a failed spawn attempt to `Stopped` so the planner
    /// re-evaluates it. The incarnation never ran, so its uptime is zero and
    /// can never trigger a stability reset.
    pub(crate) fn reset_after_failed_spawn(&mut self) {
        self.state = EntryState::Stopped;
        self.pid = 0;
        self.last_uptime = Duration::ZERO;
    }

    pub(crate) fn take_cgroup(&mut self) -> Option<CgroupHandle> {
        self.cgroup.take()
    }
}
