use crate::pw::engine::{EntryTable, pw_event};
use crate::pw::entry::SupervisedEntry;
use crate::pw::{build_info, config, engine};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "procwarden", version, about = "process supervisor with cgroup v2 resource limits")]
pub struct Args {
    /// Path to a services config YAML
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Supervise a single ad-hoc command instead of a config file
    #[arg(long = "run", conflicts_with = "config")]
    pub run: Option<String>,

    /// Disable cgroup resource limits entirely
    #[arg(long = "no-cgroup")]
    pub no_cgroup: bool,
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    pw_event("boot", None, build_info::banner());
    pw_event("boot", None, format!("pid={}", std::process::id()));

    let table = if let Some(path) = &args.config {
        config::load_entries(path)?
    } else if let Some(cmdline) = &args.run {
        single_command_table(cmdline)
    } else {
        pw_event("boot", None, "no config specified, running built-in demo entries");
        demo_table()
    };

    engine::run_supervisor(table, !args.no_cgroup)
}

/// Wraps an ad-hoc command line for supervision. `exec` makes the shell
/// replace itself, so the command leads the process group directly and the
/// default SIGTERM disposition applies to it, not to an intermediate shell.
fn single_command_table(cmdline: &str) -> EntryTable {
    let mut entry = SupervisedEntry::new(
        "main",
        "/bin/sh",
        vec!["-c".to_string(), format!("exec {cmdline}")],
    );
    entry.max_restarts = 10;
    entry.restart_delay = Duration::from_secs(2);
    entry.backoff_factor = 1.5;

    let mut table = EntryTable::new();
    table.insert(entry.name.clone(), entry);
    table
}

/// Two built-in entries: one that stays up and one that keeps crashing, so
/// an unconfigured run demonstrates both supervision paths.
fn demo_table() -> EntryTable {
    let mut heartbeat = SupervisedEntry::new(
        "heartbeat",
        "/bin/sh",
        vec![
            "-c".to_string(),
            "while true; do echo \"[heartbeat] alive at $(date)\"; sleep 2; done".to_string(),
        ],
    );
    heartbeat.max_restarts = 5;
    heartbeat.restart_delay = Duration::from_secs(1);
    heartbeat.backoff_factor = 2.0;

    let mut crasher = SupervisedEntry::new(
        "crasher",
        "/bin/sh",
        vec![
            "-c".to_string(),
            "echo '[crasher] starting...'; sleep 3; echo '[crasher] crashing!'; exit 1"
                .to_string(),
        ],
    );
    crasher.max_restarts = 3;
    crasher.restart_delay = Duration::from_secs(2);
    crasher.backoff_factor = 2.0;

    let mut table = EntryTable::new();
    table.insert(heartbeat.name.clone(), heartbeat);
    table.insert(crasher.name.clone(), crasher);
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_command_is_exec_wrapped() {
        let table = single_command_table("sleep 3600");
        let main = &table["main"];
        assert_eq!(main.command, "/bin/sh");
        assert_eq!(main.args[0], "-c");
        assert_eq!(main.args[1], "exec sleep 3600");
        assert_eq!(main.max_restarts, 10);
    }

    #[test]
    fn demo_declares_two_entries() {
        let table = demo_table();
        assert_eq!(table.len(), 2);
        assert!(table.contains_key("heartbeat"));
        assert!(table.contains_key("crasher"));
    }
}
