//! Delayed reading of per-container cgroup resource limits.
//!
//! Runtimes report limits in the container manifest, but the values the
//! kernel actually enforces live in the control-group filesystem and may
//! only settle after the container has started. This module reads them out
//! of band, on a lookup-source worker, and patches the already-published
//! descriptor:
//!
//! - `memory.limit_in_bytes`, `cpu.shares`, `cpu.cfs_quota_us` and
//!   `cpu.cfs_period_us` as range-checked single integers,
//! - `cpuset.effective_cpus` as a counted cpu list.
//!
//! A subsystem whose cgroup path does not mention the container id is a
//! shared cgroup with nothing per-container to report and is skipped.

mod limits;
mod list_counter;

pub use limits::{
    read_resource_limits, update, CgroupLimitsKey, CgroupLimitsSource, CgroupLimitsValue,
    CgroupRoots, CGROUP_VAL_MAX,
};
pub use list_counter::count_cpu_list;
