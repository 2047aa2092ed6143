use crate::pw::engine::{EntryTable, pw_event};
use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use tokio::sync::mpsc::UnboundedSender;

/// Drains every exited child without blocking.
///
/// SIGCHLD deliveries coalesce: N simultaneous deaths can arrive as a single
/// signal, so one notification must loop `waitpid(-1, WNOHANG)` until the
/// kernel reports nothing left. Each reaped pid is matched against the entry
/// table, recorded via `mark_exited`, and announced on `reap_tx` for the
/// engine to evaluate. No restart decisions are made here.
pub fn drain_exited(table: &mut EntryTable, reap_tx: &UnboundedSender<String>) {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                let Some((pid, code)) = exit_code_for(&status) else {
                    // Stop/continue notifications are not exits.
                    continue;
                };
                record_exit(table, reap_tx, pid, code);
            }
            // No children at all.
            Err(Errno::ECHILD) => break,
            Err(e) => {
                pw_event("reap", None, format!("waitpid failed: {e}"));
                break;
            }
        }
    }
}

/// Maps a wait status to `(pid, exit code)`, using the shell convention of
/// `128 + signal` for signal deaths so they stay distinguishable from plain
/// nonzero exits (SIGKILL -> 137, SIGTERM -> 143).
pub(crate) fn exit_code_for(status: &WaitStatus) -> Option<(i32, i32)> {
    match status {
        WaitStatus::Exited(pid, code) => Some((pid.as_raw(), *code)),
        WaitStatus::Signaled(pid, sig, _core_dumped) => {
            Some((pid.as_raw(), 128 + *sig as i32))
        }
        _ => None,
    }
}

fn record_exit(table: &mut EntryTable, reap_tx: &UnboundedSender<String>, pid: i32, code: i32) {
    let Some((name, entry)) = table.iter_mut().find(|(_, e)| e.pid() == pid) else {
        // Happens when the supervisor is pid 1 and inherits reparented
        // grandchildren; nothing of ours to update.
        pw_event("reap", None, format!("reaped unknown pid {pid}"));
        return;
    };

    let runtime = entry.start_time.elapsed();
    entry.mark_exited(code, runtime);
    pw_event(
        "reap",
        Some(name),
        format!("pid={pid} exited with code {code} after {runtime:.1?}"),
    );
    let _ = reap_tx.send(name.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;
    use nix::unistd::Pid;

    #[test]
    fn normal_exit_keeps_raw_code() {
        let status = WaitStatus::Exited(Pid::from_raw(42), 7);
        assert_eq!(exit_code_for(&status), Some((42, 7)));
    }

    #[test]
    fn signal_death_maps_to_128_plus_signal() {
        let killed = WaitStatus::Signaled(Pid::from_raw(9), Signal::SIGKILL, false);
        assert_eq!(exit_code_for(&killed), Some((9, 137)));

        let segv = WaitStatus::Signaled(Pid::from_raw(10), Signal::SIGSEGV, true);
        assert_eq!(exit_code_for(&segv), Some((10, 139)));

        let termed = WaitStatus::Signaled(Pid::from_raw(11), Signal::SIGTERM, false);
        assert_eq!(exit_code_for(&termed), Some((11, 143)));
    }

    #[test]
    fn stop_and_continue_are_not_exits() {
        let stopped = WaitStatus::Stopped(Pid::from_raw(5), Signal::SIGSTOP);
        assert_eq!(exit_code_for(&stopped), None);

        let continued = WaitStatus::Continued(Pid::from_raw(5));
        assert_eq!(exit_code_for(&continued), None);
    }
}
