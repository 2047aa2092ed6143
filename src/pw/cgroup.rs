use anyhow::Context as _;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

pub const CGROUP_FS_ROOT: &str = "/sys/fs/cgroup";

/// cgroup v2 `cpu.max` period in microseconds. 100ms is the conventional
/// granularity; the quota is expressed against it.
const CPU_PERIOD_USEC: u64 = 100_000;

const SUBTREE_CONTROLLERS: &str = "+cpu +memory +pids";

/// Writes a cgroup control file.
///
/// Control files are populated by the kernel when the cgroup directory is
/// created, so this opens for write without create: writing to a path that
/// does not exist means the cgroup is gone or the controller is unavailable,
/// and must surface as an error rather than leave a stray regular file.
fn write_control(path: &Path, content: &str) -> anyhow::Result<()> {
    let mut f = fs::OpenOptions::new().write(true).open(path).map_err(|e| {
        anyhow::anyhow!(
            "open for write {} failed: kind={:?} os_error={:?} err={}",
            path.display(),
            e.kind(),
            e.raw_os_error(),
            e
        )
    })?;
    f.write_all(content.as_bytes())
        .map_err(|e| anyhow::anyhow!("write {} failed: {e}", path.display()))?;
    Ok(())
}

/// Renders the `cpu.max` payload for a percentage quota, where 100 is one
/// full core (50 -> "50000 100000", 200 -> "200000 100000").
pub(crate) fn cpu_max_payload(percent: u32) -> String {
    let quota = u64::from(percent) * CPU_PERIOD_USEC / 100;
    format!("{quota} {CPU_PERIOD_USEC}")
}

/// The writable base directory under which per-entry cgroups are created.
///
/// Obtained once at startup by [`CgroupRoot::discover`]; when discovery fails
/// the supervisor runs without resource limits.
#[derive(Debug, Clone)]
pub struct CgroupRoot {
    base: PathBuf,
}

impl CgroupRoot {
    /// Finds a cgroup base this process can create children under.
    ///
    /// Tried in order:
    /// 1. the process's own cgroup (from `/proc/self/cgroup`), after
    ///    relocating the supervisor into a `supervisor` leaf so that
    ///    controllers can be enabled in the parent (the v2 "no internal
    ///    processes" rule);
    /// 2. a `procwarden` child of the own cgroup, without relocation;
    /// 3. `/sys/fs/cgroup/procwarden` directly (root on non-systemd boxes).
    ///
    /// How a *delegated* subtree is obtained in the first place (systemd
    /// scope units etc.) is a deployment concern handled outside this
    /// binary.
    pub fn discover() -> anyhow::Result<Self> {
        let self_cgroup = read_self_cgroup().context("read /proc/self/cgroup")?;
        let parent = Path::new(CGROUP_FS_ROOT).join(self_cgroup.trim_start_matches('/'));

        if let Some(root) = Self::try_relocated(&parent) {
            return Ok(root);
        }

        let named = parent.join("procwarden");
        if fs::create_dir_all(&named).is_ok() {
            // Controllers may already be enabled by whoever delegated the
            // subtree; failure here is tolerated.
            let _ = enable_controllers(&named);
            return Ok(Self { base: named });
        }

        let direct = Path::new(CGROUP_FS_ROOT).join("procwarden");
        fs::create_dir_all(&direct).with_context(|| {
            format!(
                "no writable cgroup base found (tried {} and {})",
                parent.display(),
                direct.display()
            )
        })?;
        let _ = enable_controllers(&direct);
        Ok(Self { base: direct })
    }

    /// Moves this process into a `supervisor` leaf under `parent`, then
    /// enables controllers in `parent` for the per-entry children.
    fn try_relocated(parent: &Path) -> Option<Self> {
        let leaf = parent.join("supervisor");
        fs::create_dir_all(&leaf).ok()?;
        let me = std::process::id().to_string();
        write_control(&leaf.join("cgroup.procs"), &me).ok()?;
        enable_controllers(parent).ok()?;
        Some(Self {
            base: parent.to_path_buf(),
        })
    }

    /// Uses an explicit base path. Intended for tests and for callers that
    /// already hold a delegated subtree.
    pub fn at(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }
}

/// Parses the v2 line (`0::/path`) out of `/proc/self/cgroup`.
fn read_self_cgroup() -> anyhow::Result<String> {
    let raw = fs::read_to_string("/proc/self/cgroup")?;
    for line in raw.lines() {
        if let Some(path) = line.strip_prefix("0::") {
            return Ok(path.trim().to_string());
        }
    }
    anyhow::bail!("no cgroup v2 entry in /proc/self/cgroup: {raw:?}")
}

fn enable_controllers(dir: &Path) -> anyhow::Result<()> {
    write_control(&dir.join("cgroup.subtree_control"), SUBTREE_CONTROLLERS)
        .with_context(|| format!("enable controllers for {}", dir.display()))
}

/// An owned per-entry leaf cgroup directory.
///
/// Dropped handles leave the directory in place; [`CgroupHandle::destroy`]
/// removes it, which the kernel only permits once no tasks are attached.
#[derive(Debug)]
pub struct CgroupHandle {
    name: String,
    path: PathBuf,
}

impl CgroupHandle {
    /// Creates `<base>/<name>`. Creating a directory that already exists is
    /// not an error: cgroups left behind by a crashed supervisor are reused.
    pub fn create(root: &CgroupRoot, name: &str) -> anyhow::Result<Self> {
        let path = root.base().join(name);
        fs::create_dir_all(&path)
            .with_context(|| format!("create cgroup {}", path.display()))?;
        Ok(Self {
            name: name.to_string(),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hard memory limit in bytes (`memory.max`). No-op when `bytes` is 0.
    pub fn set_memory_limit(&self, bytes: u64) -> anyhow::Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        write_control(&self.path.join("memory.max"), &bytes.to_string())
            .with_context(|| format!("set memory.max for {}", self.name))
    }

    /// CPU bandwidth limit (`cpu.max`) as a percentage of one core. No-op
    /// when `percent` is 0.
    pub fn set_cpu_quota(&self, percent: u32) -> anyhow::Result<()> {
        if percent == 0 {
            return Ok(());
        }
        write_control(&self.path.join("cpu.max"), &cpu_max_payload(percent))
            .with_context(|| format!("set cpu.max for {}", self.name))
    }

    /// Task count limit (`pids.max`). No-op when `max` is 0.
    pub fn set_pids_limit(&self, max: u32) -> anyhow::Result<()> {
        if max == 0 {
            return Ok(());
        }
        write_control(&self.path.join("pids.max"), &max.to_string())
            .with_context(|| format!("set pids.max for {}", self.name))
    }

    /// Moves `pid` (and atomically all of its threads) into this cgroup.
    pub fn attach(&self, pid: i32) -> anyhow::Result<()> {
        write_control(&self.path.join("cgroup.procs"), &pid.to_string())
            .with_context(|| format!("attach pid {pid} to cgroup {}", self.name))
    }

    /// Current memory usage in bytes (`memory.current`).
    pub fn current_memory_bytes(&self) -> anyhow::Result<u64> {
        let path = self.path.join("memory.current");
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        raw.trim()
            .parse()
            .with_context(|| format!("parse memory.current for {}: {raw:?}", self.name))
    }

    /// Removes the cgroup directory. Only an empty cgroup can be removed.
    pub fn destroy(self) -> anyhow::Result<()> {
        fs::remove_dir(&self.path)
            .with_context(|| format!("remove cgroup {}", self.path.display()))
    }
}
