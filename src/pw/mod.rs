pub mod build_info;
pub mod cgroup;
pub mod cli;
pub mod config;
pub mod engine;
pub mod entry;
pub mod planner;
pub mod procfs;
pub mod reaper;

pub fn main() -> anyhow::Result<()> {
    cli::run()
}
