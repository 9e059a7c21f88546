use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::async_source::AsyncKeyValueSource;
use crate::container::manager::ContainerManager;
use crate::container::{ContainerId, ThreadInfo};
use crate::fsutil;

use super::list_counter::count_cpu_list;

/// Upper bound on accepted cgroup values: 4 TiB.
///
/// Runtimes report "unlimited" as huge sentinels close to `i64::MAX`; a
/// 32-bit kilobyte rendering of such a value overflows downstream. 4 TiB is
/// above any realistic per-container limit and far below the overflow
/// threshold, so larger values are treated the same as unlimited: ignored.
pub const CGROUP_VAL_MAX: i64 = (1 << 42) - 1;

/// Identifies one delayed limit read: the container and its per-subsystem
/// cgroup paths as reported in `/proc/<pid>/cgroup`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CgroupLimitsKey {
    pub container_id: ContainerId,
    pub mem_cgroup: String,
    pub cpu_cgroup: String,
    pub cpuset_cgroup: String,
}

impl CgroupLimitsKey {
    /// Builds the lookup key from a thread's cgroup paths. An absent path
    /// becomes the empty string, which never contains the container id and
    /// therefore skips the subsystem.
    pub fn from_thread_info(container_id: ContainerId, thread_info: &ThreadInfo) -> Self {
        Self {
            container_id,
            mem_cgroup: thread_info.mem_cgroup.clone().unwrap_or_default(),
            cpu_cgroup: thread_info.cpu_cgroup.clone().unwrap_or_default(),
            cpuset_cgroup: thread_info.cpuset_cgroup.clone().unwrap_or_default(),
        }
    }
}

/// Values read from the cgroup filesystem. `None` means the file was
/// missing, unparseable, out of range, or the subsystem was skipped; such
/// fields are never written to the descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgroupLimitsValue {
    pub memory_limit: Option<i64>,
    pub cpu_shares: Option<i64>,
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<i64>,
    pub cpuset_cpu_count: Option<u32>,
}

/// Mount roots of the cgroup subsystems, discovered by the host-facing
/// side of the agent and injected here. A `None` root disables the
/// subsystem.
#[derive(Debug, Clone, Default)]
pub struct CgroupRoots {
    pub memory: Option<PathBuf>,
    pub cpu: Option<PathBuf>,
    pub cpuset: Option<PathBuf>,
}

/// Reads a single integer limit file, accepting values in
/// `(0, CGROUP_VAL_MAX]`.
fn read_cgroup_value(root: &Path, cgroup: &str, filename: &str) -> Option<i64> {
    let path = root
        .join(cgroup.trim_start_matches('/'))
        .join(filename);

    let line = match fsutil::read_first_line(&path) {
        Ok(line) => line,
        Err(err) => {
            log::debug!("{err}");
            return None;
        }
    };

    let value: i64 = match line.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            log::debug!("unparseable value in `{}`: `{}`", path.display(), line.trim());
            return None;
        }
    };

    if value <= 0 || value > CGROUP_VAL_MAX {
        log::debug!(
            "value of `{}` ({}) out of range, ignoring",
            path.display(),
            value
        );
        return None;
    }

    Some(value)
}

/// Reads a cpuset file and counts the cpus in it; zero counts are treated
/// as "not found".
fn read_cgroup_cpu_count(root: &Path, cgroup: &str, filename: &str) -> Option<u32> {
    let path = root
        .join(cgroup.trim_start_matches('/'))
        .join(filename);

    let line = match fsutil::read_first_line(&path) {
        Ok(line) => line,
        Err(err) => {
            log::debug!("{err}");
            return None;
        }
    };

    let count = match count_cpu_list(&line) {
        Some(count) => count,
        None => {
            log::debug!("invalid cpu list in `{}`: `{}`", path.display(), line.trim());
            return None;
        }
    };

    log::debug!("cpu set from `{}`: {} cpus", path.display(), count);
    (count > 0).then_some(count)
}

/// Reads every subsystem named by `key`, skipping those whose cgroup path
/// does not mention the container id (a shared cgroup carries no
/// per-container limit).
pub fn read_resource_limits(roots: &CgroupRoots, key: &CgroupLimitsKey) -> CgroupLimitsValue {
    let id = key.container_id.as_str();
    let mut value = CgroupLimitsValue::default();

    if let Some(root) = &roots.memory {
        if key.mem_cgroup.contains(id) {
            value.memory_limit =
                read_cgroup_value(root, &key.mem_cgroup, "memory.limit_in_bytes");
        } else {
            log::debug!(
                "({id}) no per-container memory cgroup (`{}`), ignoring",
                key.mem_cgroup
            );
        }
    }

    if let Some(root) = &roots.cpu {
        if key.cpu_cgroup.contains(id) {
            value.cpu_shares = read_cgroup_value(root, &key.cpu_cgroup, "cpu.shares");
            value.cpu_quota = read_cgroup_value(root, &key.cpu_cgroup, "cpu.cfs_quota_us");
            value.cpu_period = read_cgroup_value(root, &key.cpu_cgroup, "cpu.cfs_period_us");
        } else {
            log::debug!(
                "({id}) no per-container cpu cgroup (`{}`), ignoring",
                key.cpu_cgroup
            );
        }
    }

    if let Some(root) = &roots.cpuset {
        if key.cpuset_cgroup.contains(id) {
            value.cpuset_cpu_count =
                read_cgroup_cpu_count(root, &key.cpuset_cgroup, "cpuset.effective_cpus");
        } else {
            log::debug!(
                "({id}) no per-container cpuset cgroup (`{}`), ignoring",
                key.cpuset_cgroup
            );
        }
    }

    log::debug!(
        "({id}) cgroup limits: mem={:?} shares={:?} quota={:?} period={:?} cpus={:?}",
        value.memory_limit,
        value.cpu_shares,
        value.cpu_quota,
        value.cpu_period,
        value.cpuset_cpu_count
    );

    value
}

/// Writes the fields that were actually found into the descriptor, if the
/// container still exists; results for torn-down containers are dropped.
pub fn update(manager: &ContainerManager, key: &CgroupLimitsKey, value: &CgroupLimitsValue) {
    let applied = manager.update_resource_limits(&key.container_id, |container| {
        if let Some(memory_limit) = value.memory_limit {
            container.memory_limit = memory_limit;
        }
        if let Some(cpu_shares) = value.cpu_shares {
            container.cpu_shares = cpu_shares;
        }
        if let Some(cpu_quota) = value.cpu_quota {
            container.cpu_quota = cpu_quota;
        }
        if let Some(cpu_period) = value.cpu_period {
            container.cpu_period = cpu_period;
        }
        if let Some(cpuset_cpu_count) = value.cpuset_cpu_count {
            container.cpuset_cpu_count = cpuset_cpu_count;
        }
    });

    if applied {
        log::debug!("({}) stored cgroup limits", key.container_id);
    } else {
        log::info!(
            "({}) dropping cgroup limits for already gone container",
            key.container_id
        );
    }
}

/// Asynchronous source for delayed cgroup-limit reads.
///
/// A separate instance from the metadata source: limit reads are keyed by
/// the full cgroup-path tuple and must not queue behind runtime fetches.
pub struct CgroupLimitsSource {
    source: AsyncKeyValueSource<CgroupLimitsKey, CgroupLimitsValue>,
}

impl CgroupLimitsSource {
    pub fn new(max_wait: Duration, ttl: Duration, roots: CgroupRoots) -> Self {
        let source = AsyncKeyValueSource::new(max_wait, ttl, move |key: &CgroupLimitsKey| {
            read_resource_limits(&roots, key)
        });
        Self { source }
    }

    /// Enqueues a limit read for `key`; the result is applied to the
    /// manager's descriptor as soon as it is available.
    pub fn schedule(&self, manager: &Arc<ContainerManager>, key: CgroupLimitsKey) {
        let callback_manager = Arc::clone(manager);
        let completed = self.source.lookup(key.clone(), move |key, value| {
            update(&callback_manager, key, value);
        });

        if let Some(value) = completed {
            update(manager, &key, &value);
        }
    }

    pub fn stop(&self) {
        self.source.stop();
    }
}
