use anyhow::Context as _;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// How many memory mappings the introspection dump prints before truncating.
const MAPS_DISPLAY_LIMIT: usize = 10;

/// Snapshot of `/proc/<pid>/{status,fd,maps}` for one process.
///
/// This is a pure read of the kernel's current view: nothing is cached and
/// every descriptor opened here is closed before the call returns.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: i32,
    /// `Name:` from the status file.
    pub name: String,
    /// `State:` verbatim, e.g. `S (sleeping)`. The leading letter is the
    /// kernel state code (R/S/D/Z/T/X).
    pub state: String,
    pub ppid: i32,
    pub threads: i32,
    /// Resident set size in kilobytes.
    pub vm_rss_kb: u64,
    /// Virtual size in kilobytes.
    pub vm_size_kb: u64,
    pub fds: Vec<FdInfo>,
    pub memory_maps: Vec<MemoryMapping>,
}

/// One open file descriptor and its symlink target.
///
/// Targets are kept verbatim: a filesystem path, `socket:[inode]`,
/// `pipe:[inode]`, or an `anon_inode:` label.
#[derive(Debug, Clone)]
pub struct FdInfo {
    pub fd: i32,
    pub target: String,
}

/// One line of `/proc/<pid>/maps`.
#[derive(Debug, Clone)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    /// Empty for anonymous mappings.
    pub pathname: String,
}

/// Reads process information for `pid` from procfs.
///
/// Fails if `/proc/<pid>` does not exist (the process is gone). Failures of
/// the fd and maps sub-reads degrade to empty lists rather than failing the
/// whole call; only the status file is mandatory.
pub fn read_process_info(pid: i32) -> anyhow::Result<ProcessInfo> {
    let proc_dir = PathBuf::from(format!("/proc/{pid}"));
    anyhow::ensure!(proc_dir.is_dir(), "process {pid} does not exist");

    let status_raw = fs::read_to_string(proc_dir.join("status"))
        .with_context(|| format!("read /proc/{pid}/status"))?;

    let mut info = parse_status(pid, &status_raw);
    info.fds = read_fds(&proc_dir);
    info.memory_maps = read_maps(&proc_dir);
    Ok(info)
}

/// Parses the key/value body of `/proc/<pid>/status`.
///
/// Unknown keys are ignored; malformed numeric fields parse as zero.
fn parse_status(pid: i32, raw: &str) -> ProcessInfo {
    let mut info = ProcessInfo {
        pid,
        name: String::new(),
        state: String::new(),
        ppid: 0,
        threads: 0,
        vm_rss_kb: 0,
        vm_size_kb: 0,
        fds: Vec::new(),
        memory_maps: Vec::new(),
    };

    for line in raw.lines() {
        let Some((key, val)) = line.split_once(':') else {
            continue;
        };
        let val = val.trim();
        match key.trim() {
            "Name" => info.name = val.to_string(),
            "State" => info.state = val.to_string(),
            "PPid" => info.ppid = val.parse().unwrap_or(0),
            "Threads" => info.threads = val.parse().unwrap_or(0),
            // Sizes look like "1234 kB"; the unit field is dropped.
            "VmRSS" => info.vm_rss_kb = first_field_u64(val),
            "VmSize" => info.vm_size_kb = first_field_u64(val),
            _ => {}
        }
    }
    info
}

fn first_field_u64(val: &str) -> u64 {
    val.split_whitespace()
        .next()
        .and_then(|f| f.parse().ok())
        .unwrap_or(0)
}

/// Resolves every symlink in `/proc/<pid>/fd/`.
fn read_fds(proc_dir: &Path) -> Vec<FdInfo> {
    let fd_dir = proc_dir.join("fd");
    let entries = match fs::read_dir(&fd_dir) {
        Ok(rd) => rd,
        Err(_) => return Vec::new(),
    };

    let mut fds = Vec::new();
    for entry in entries.flatten() {
        let Ok(fd) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        // The descriptor can close between readdir and readlink; skip it.
        let Ok(target) = fs::read_link(entry.path()) else {
            continue;
        };
        fds.push(FdInfo {
            fd,
            target: target.to_string_lossy().into_owned(),
        });
    }
    fds.sort_by_key(|f| f.fd);
    fds
}

/// Parses `/proc/<pid>/maps` lines: `start-end perms offset dev inode [pathname]`.
fn read_maps(proc_dir: &Path) -> Vec<MemoryMapping> {
    let raw = match fs::read_to_string(proc_dir.join("maps")) {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };
    parse_maps(&raw)
}

fn parse_maps(raw: &str) -> Vec<MemoryMapping> {
    let mut maps = Vec::new();
    for line in raw.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            continue;
        }
        let Some((start_s, end_s)) = fields[0].split_once('-') else {
            continue;
        };
        maps.push(MemoryMapping {
            start: u64::from_str_radix(start_s, 16).unwrap_or(0),
            end: u64::from_str_radix(end_s, 16).unwrap_or(0),
            perms: fields[1].to_string(),
            pathname: if fields.len() >= 6 {
                fields[5..].join(" ")
            } else {
                String::new()
            },
        });
    }
    maps
}

impl fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "pid={} name={} state={}",
            self.pid, self.name, self.state
        )?;
        writeln!(f, "ppid={} threads={}", self.ppid, self.threads)?;
        writeln!(
            f,
            "memory rss={} KB virtual={} KB",
            self.vm_rss_kb, self.vm_size_kb
        )?;

        writeln!(f, "open file descriptors ({}):", self.fds.len())?;
        for fd in &self.fds {
            writeln!(f, "  {:>3} -> {}", fd.fd, fd.target)?;
        }

        writeln!(
            f,
            "memory maps (showing {} of {}):",
            self.memory_maps.len().min(MAPS_DISPLAY_LIMIT),
            self.memory_maps.len()
        )?;
        for m in self.memory_maps.iter().take(MAPS_DISPLAY_LIMIT) {
            writeln!(
                f,
                "  {:012x}-{:012x} {} {}",
                m.start, m.end, m.perms, m.pathname
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS_SAMPLE: &str = "\
Name:\tbash
Umask:\t0022
State:\tS (sleeping)
Tgid:\t1234
Pid:\t1234
PPid:\t1233
Threads:\t2
VmSize:\t   22520 kB
VmRSS:\t    5236 kB
nonvoluntary_ctxt_switches:\t15
";

    #[test]
    fn parses_status_fields() {
        let info = parse_status(1234, STATUS_SAMPLE);
        assert_eq!(info.name, "bash");
        assert_eq!(info.state, "S (sleeping)");
        assert_eq!(info.ppid, 1233);
        assert_eq!(info.threads, 2);
        assert_eq!(info.vm_rss_kb, 5236);
        assert_eq!(info.vm_size_kb, 22520);
    }

    #[test]
    fn malformed_numeric_fields_parse_as_zero() {
        let info = parse_status(1, "Name:\tx\nPPid:\tnot-a-number\nVmRSS:\t?? kB\n");
        assert_eq!(info.ppid, 0);
        assert_eq!(info.vm_rss_kb, 0);
    }

    #[test]
    fn parses_maps_lines() {
        let raw = "\
00400000-00401000 r-xp 00000000 08:01 123456 /bin/bash
7ffd1c000000-7ffd1c021000 rw-p 00000000 00:00 0 [stack]
7f1234000000-7f1234001000 rw-p 00000000 00:00 0
garbage line
";
        let maps = parse_maps(raw);
        assert_eq!(maps.len(), 3);
        assert_eq!(maps[0].start, 0x0040_0000);
        assert_eq!(maps[0].end, 0x0040_1000);
        assert_eq!(maps[0].perms, "r-xp");
        assert_eq!(maps[0].pathname, "/bin/bash");
        assert_eq!(maps[1].pathname, "[stack]");
        // Anonymous mapping keeps an empty pathname.
        assert_eq!(maps[2].pathname, "");
    }

    #[test]
    fn reads_own_process() {
        let pid = std::process::id() as i32;
        let info = read_process_info(pid).expect("own /proc entry readable");
        assert_eq!(info.pid, pid);
        assert!(!info.name.is_empty());
        assert!(!info.state.is_empty());
        assert!(info.threads >= 1);
        assert!(info.vm_rss_kb > 0);
        // A test binary always has stdio open.
        assert!(!info.fds.is_empty());
        assert!(!info.memory_maps.is_empty());
    }

    #[test]
    fn quick_succession_reads_agree_on_identity_fields() {
        let pid = std::process::id() as i32;
        let a = read_process_info(pid).unwrap();
        let b = read_process_info(pid).unwrap();
        assert_eq!(a.pid, b.pid);
        assert_eq!(a.name, b.name);
        assert_eq!(a.ppid, b.ppid);
    }

    #[test]
    fn missing_process_is_an_error() {
        // pid_max caps real pids well below i32::MAX.
        assert!(read_process_info(i32::MAX).is_err());
    }

    #[test]
    fn display_contains_pid_and_fd_lines() {
        let pid = std::process::id() as i32;
        let info = read_process_info(pid).unwrap();
        let rendered = info.to_string();
        assert!(rendered.contains(&format!("pid={pid}")));
        assert!(rendered.contains("open file descriptors"));
        assert!(rendered.contains(" -> "));
    }
}
