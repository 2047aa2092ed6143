use crate::pw::cgroup::CgroupRoot;
use crate::pw::entry::{EntryState, SupervisedEntry};
use crate::pw::planner::{self, Decision};
use crate::pw::procfs;
use crate::pw::reaper;
use anyhow::Context as _;
use chrono::Local;
use nix::sys::signal::Signal;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Mapping from entry name to entry. Populated once before the event loop
/// starts; only the fields inside entries are mutated afterwards.
pub type EntryTable = BTreeMap<String, SupervisedEntry>;

/// Wall-clock budget for polite termination before escalating to SIGKILL.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Timestamped event line on stderr: `<ts> [component] entry=<name> <msg>`.
pub(crate) fn pw_event(component: &str, entry: Option<&str>, msg: impl AsRef<str>) {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    match entry {
        Some(name) => eprintln!("{ts} [{component}] entry={name} {}", msg.as_ref()),
        None => eprintln!("{ts} [{component}] {}", msg.as_ref()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    Running,
    ShuttingDown,
    Halted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::ShuttingDown => "shutting_down",
            Phase::Halted => "halted",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct PendingRestart {
    name: String,
    due: Instant,
}

/// Triggers engine shutdown from outside the event loop, equivalent to the
/// supervisor receiving SIGTERM.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }
}

/// The supervision event loop.
///
/// Strictly sequential: every handler runs to completion on the engine task
/// before the next event is picked up, so entry fields need no locking. The
/// loop multiplexes signal arrivals, reap notifications, restart timers and
/// the internal shutdown trigger.
pub struct Engine {
    table: EntryTable,
    cgroup_root: Option<CgroupRoot>,
    phase: Phase,
    pending_restarts: Vec<PendingRestart>,
    reap_tx: mpsc::UnboundedSender<String>,
    reap_rx: mpsc::UnboundedReceiver<String>,
    shutdown_tx: mpsc::UnboundedSender<()>,
    shutdown_rx: mpsc::UnboundedReceiver<()>,
}

impl Engine {
    pub fn new(table: EntryTable, cgroup_root: Option<CgroupRoot>) -> Self {
        let (reap_tx, reap_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        Self {
            table,
            cgroup_root,
            phase: Phase::Starting,
            pending_restarts: Vec::new(),
            reap_tx,
            reap_rx,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    pub fn entry(&self, name: &str) -> Option<&SupervisedEntry> {
        self.table.get(name)
    }

    /// Starts every entry and runs the event loop until shutdown completes.
    ///
    /// A spawn failure during startup aborts the whole run: the system never
    /// half-starts. After startup, errors are contained per entry.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        // Signal interest is registered before the first spawn so that an
        // immediately-dying child cannot race the SIGCHLD handler.
        let mut sigchld = signal(SignalKind::child()).context("install SIGCHLD handler")?;
        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
        let mut sighup = signal(SignalKind::hangup()).context("install SIGHUP handler")?;
        let mut sigusr1 =
            signal(SignalKind::user_defined1()).context("install SIGUSR1 handler")?;

        let names: Vec<String> = self.table.keys().cloned().collect();
        for name in &names {
            if let Some(entry) = self.table.get_mut(name) {
                entry
                    .spawn(self.cgroup_root.as_ref())
                    .with_context(|| format!("startup aborted: could not start {name}"))?;
            }
        }
        self.phase = Phase::Running;
        pw_event(
            "engine",
            None,
            format!("supervising {} entries, send SIGTERM or Ctrl+C to stop", self.table.len()),
        );

        loop {
            let next_due = self.pending_restarts.iter().map(|p| p.due).min();
            tokio::select! {
                _ = sigchld.recv() => {
                    reaper::drain_exited(&mut self.table, &self.reap_tx);
                }
                Some(name) = self.reap_rx.recv() => {
                    self.evaluate_restart(&name);
                }
                _ = sigterm.recv() => {
                    pw_event("signal", None, "received SIGTERM");
                    break;
                }
                _ = sigint.recv() => {
                    pw_event("signal", None, "received SIGINT");
                    break;
                }
                _ = sighup.recv() => {
                    // Reserved surface: acknowledged, reload not implemented.
                    pw_event("signal", None, "received SIGHUP (reload not implemented)");
                }
                _ = sigusr1.recv() => {
                    pw_event("signal", None, "received SIGUSR1, dumping process info");
                    self.dump_process_info();
                }
                Some(()) = self.shutdown_rx.recv() => {
                    pw_event("signal", None, "internal shutdown trigger");
                    break;
                }
                _ = sleep_until_opt(next_due) => {
                    self.fire_due_restarts();
                }
            }
        }

        self.shutdown(&mut sigchld, &mut sighup).await;
        Ok(())
    }

    /// Runs the planner for a reaped entry and schedules its restart timer.
    fn evaluate_restart(&mut self, name: &str) {
        if self.phase != Phase::Running {
            return;
        }
        let Some(entry) = self.table.get_mut(name) else {
            pw_event("plan", None, format!("reap notification for unknown entry {name:?}"));
            return;
        };
        if entry.state() != EntryState::Stopped {
            return;
        }

        match planner::plan_restart(entry) {
            Decision::Retry { delay, attempt } => {
                pw_event(
                    "plan",
                    Some(name),
                    format!(
                        "restarting in {delay:?} (attempt {attempt}/{})",
                        entry.max_restarts
                    ),
                );
                self.pending_restarts.push(PendingRestart {
                    name: name.to_string(),
                    due: Instant::now() + delay,
                });
            }
            Decision::GiveUp => {}
        }
    }

    /// Spawns every entry whose restart timer has expired.
    ///
    /// A failed spawn puts the entry back to `Stopped` and re-emits a reap
    /// notification, so the planner re-evaluates it on the next iteration
    /// and eventually exhausts the budget.
    fn fire_due_restarts(&mut self) {
        let now = Instant::now();
        let mut due: Vec<String> = Vec::new();
        self.pending_restarts.retain(|p| {
            if p.due <= now {
                due.push(p.name.clone());
                false
            } else {
                true
            }
        });

        for name in due {
            let Some(entry) = self.table.get_mut(&name) else {
                continue;
            };
            if entry.state() != EntryState::Stopped {
                continue;
            }
            if let Err(e) = entry.spawn(self.cgroup_root.as_ref()) {
                pw_event("spawn", Some(&name), format!("restart failed: {e:#}"));
                entry.reset_after_failed_spawn();
                let _ = self.reap_tx.send(name);
            }
        }
    }

    /// SIGUSR1 handler: procfs dump of every running entry.
    fn dump_process_info(&self) {
        for (name, entry) in &self.table {
            if entry.state() != EntryState::Running || entry.pid() == 0 {
                continue;
            }
            println!("=== entry: {name} ===");
            match procfs::read_process_info(entry.pid()) {
                Ok(info) => println!("{info}"),
                Err(e) => {
                    // Entry vanished between the state check and the read.
                    pw_event("procfs", Some(name), format!("skipping dump: {e:#}"));
                }
            }
        }
    }

    /// Two-phase shutdown. Transitions are one-way: restart timers are
    /// cancelled immediately so no timer can spawn a child after the loop
    /// has moved past its spawn phase.
    async fn shutdown(
        &mut self,
        sigchld: &mut tokio::signal::unix::Signal,
        sighup: &mut tokio::signal::unix::Signal,
    ) {
        self.phase = Phase::ShuttingDown;
        self.pending_restarts.clear();
        pw_event("shutdown", None, "initiating graceful shutdown");

        // Phase A: polite termination of every running group.
        for (name, entry) in &self.table {
            if entry.state() == EntryState::Running {
                pw_event("shutdown", Some(name), "sending SIGTERM to process group");
                if let Err(e) = entry.signal(Signal::SIGTERM) {
                    pw_event("shutdown", Some(name), format!("SIGTERM failed: {e:#}"));
                }
            }
        }

        let deadline = Instant::now() + SHUTDOWN_DEADLINE;
        let mut poll = tokio::time::interval(SHUTDOWN_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = poll.tick() => {
                    reaper::drain_exited(&mut self.table, &self.reap_tx);
                    if self.all_entries_dead() {
                        pw_event("shutdown", None, "all processes terminated gracefully");
                        break;
                    }
                }
                _ = sigchld.recv() => {
                    reaper::drain_exited(&mut self.table, &self.reap_tx);
                    if self.all_entries_dead() {
                        pw_event("shutdown", None, "all processes terminated gracefully");
                        break;
                    }
                }
                _ = sighup.recv() => {
                    pw_event("signal", None, "received SIGHUP during shutdown, acknowledged");
                }
                _ = tokio::time::sleep_until(deadline) => {
                    // Phase B: the deadline is absolute; stragglers get the
                    // uncatchable kill and we proceed regardless.
                    for (name, entry) in &self.table {
                        if entry.pid() != 0 {
                            pw_event("shutdown", Some(name), "deadline passed, sending SIGKILL to process group");
                            if let Err(e) = entry.signal(Signal::SIGKILL) {
                                pw_event("shutdown", Some(name), format!("SIGKILL failed: {e:#}"));
                            }
                        }
                    }
                    reaper::drain_exited(&mut self.table, &self.reap_tx);
                    break;
                }
            }
        }

        self.phase = Phase::Halted;
        for (name, entry) in self.table.iter_mut() {
            if let Some(cg) = entry.take_cgroup() {
                if let Err(e) = cg.destroy() {
                    pw_event("cgroup", Some(name), format!("cleanup failed: {e:#}"));
                }
            }
        }
        pw_event("shutdown", None, format!("phase={}", self.phase));
    }

    /// True once no entry holds a live pid. Entries are reaped before this
    /// is called, so the probe only ever targets unreaped pids.
    fn all_entries_dead(&self) -> bool {
        self.table
            .values()
            .all(|entry| entry.pid() == 0 || !entry.is_alive())
    }
}

/// Pends forever when no restart timer is armed, so the select arm only
/// fires for a real deadline.
async fn sleep_until_opt(due: Option<Instant>) {
    match due {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Builds the current-thread runtime and drives the engine to completion.
///
/// The runtime is single-threaded on purpose: the engine's correctness
/// relies on handlers never running concurrently.
pub fn run_supervisor(table: EntryTable, use_cgroups: bool) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    rt.block_on(async {
        let cgroup_root = if use_cgroups {
            match CgroupRoot::discover() {
                Ok(root) => {
                    pw_event(
                        "cgroup",
                        None,
                        format!("using cgroup base {}", root.base().display()),
                    );
                    Some(root)
                }
                Err(e) => {
                    pw_event(
                        "cgroup",
                        None,
                        format!("warning: cgroup setup failed: {e:#}; continuing without resource limits"),
                    );
                    None
                }
            }
        } else {
            pw_event("cgroup", None, "cgroup usage disabled");
            None
        };

        let mut engine = Engine::new(table, cgroup_root);
        engine.run().await
    })
}
