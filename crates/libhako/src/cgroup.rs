//! Control-group attachment for container resource limits.
//!
//! The host is probed once at startup: a `cgroup.controllers` file at the
//! unified root means v2, a `memory` controller directory means v1, and
//! anything else degrades to a no-op layout that only warns. Callers never
//! re-probe; the layout is fixed for the process lifetime.

use crate::limits::LimitSpec;
use anyhow::{Result, anyhow};
use log::{debug, warn};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// v1 controllers we manage, each a separate subtree on that layout.
const V1_CONTROLLERS: [&str; 3] = ["memory", "cpu", "pids"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CgroupLayout {
    /// Unified hierarchy: one node under the cgroup root.
    V2 { root: PathBuf },
    /// Legacy hierarchy: one node per controller subtree.
    V1 { root: PathBuf },
    /// No usable cgroup support; every request is accepted as a no-op.
    Disabled,
}

impl CgroupLayout {
    pub fn probe() -> Self {
        Self::probe_at(Path::new(DEFAULT_CGROUP_ROOT))
    }

    pub fn probe_at(root: &Path) -> Self {
        if root.join("cgroup.controllers").is_file() {
            debug!("cgroup v2 detected at {}", root.display());
            return CgroupLayout::V2 {
                root: root.to_path_buf(),
            };
        }
        if root.join("memory").is_dir() {
            debug!("cgroup v1 detected at {}", root.display());
            return CgroupLayout::V1 {
                root: root.to_path_buf(),
            };
        }
        warn!("no cgroup support detected, resource limits will not apply");
        CgroupLayout::Disabled
    }

    /// Leaf node directories for a container name under this layout.
    pub fn node_paths(&self, name: &str) -> Vec<PathBuf> {
        match self {
            CgroupLayout::V2 { root } => vec![root.join(name)],
            CgroupLayout::V1 { root } => V1_CONTROLLERS
                .iter()
                .map(|ctrl| root.join(ctrl).join(name))
                .collect(),
            CgroupLayout::Disabled => Vec::new(),
        }
    }

    /// Creates the container node(s), enrolls `pid`, and applies `limits`.
    ///
    /// Individual control-file writes are non-fatal: a rejected write is
    /// logged and the remaining limits still apply. Only failure to create
    /// the node itself is reported, and the caller treats that as a warning
    /// too.
    pub fn attach(&self, pid: Pid, limits: &LimitSpec, name: &str) -> Result<()> {
        match self {
            CgroupLayout::V2 { root } => self.attach_v2(root, pid, limits, name),
            CgroupLayout::V1 { root } => self.attach_v1(root, pid, limits, name),
            CgroupLayout::Disabled => Ok(()),
        }
    }

    fn attach_v2(&self, root: &Path, pid: Pid, limits: &LimitSpec, name: &str) -> Result<()> {
        let node = root.join(name);
        create_node(&node)?;

        // Enroll the pid before writing limits: some kernels refuse limit
        // writes to an empty group.
        write_control(&node, "cgroup.procs", &pid.to_string());

        // A pre-existing enablement is fine, so this write may fail silently.
        let _ = fs::write(root.join("cgroup.subtree_control"), "+cpu +memory +pids");

        if limits.memory_bytes() > 0 {
            write_control(&node, "memory.max", &limits.memory_bytes().to_string());
        }
        if limits.cpu_shares() > 0 {
            let weight = shares_to_weight(limits.cpu_shares());
            write_control(&node, "cpu.weight", &weight.to_string());
        }
        if limits.cpu_quota_us() > 0 {
            write_control(&node, "cpu.max", &format!("{} 100000", limits.cpu_quota_us()));
        }
        if limits.pids_max() > 0 {
            write_control(&node, "pids.max", &limits.pids_max().to_string());
        }
        Ok(())
    }

    fn attach_v1(&self, root: &Path, pid: Pid, limits: &LimitSpec, name: &str) -> Result<()> {
        let pid_str = pid.to_string();

        if limits.memory_bytes() > 0 {
            let node = root.join("memory").join(name);
            if create_node(&node).is_ok() {
                write_control(&node, "memory.limit_in_bytes", &limits.memory_bytes().to_string());
                write_control(&node, "tasks", &pid_str);
            }
        }

        if limits.cpu_shares() > 0 || limits.cpu_quota_us() > 0 {
            let node = root.join("cpu").join(name);
            if create_node(&node).is_ok() {
                if limits.cpu_shares() > 0 {
                    write_control(&node, "cpu.shares", &limits.cpu_shares().to_string());
                }
                if limits.cpu_quota_us() > 0 {
                    write_control(&node, "cpu.cfs_quota_us", &limits.cpu_quota_us().to_string());
                }
                write_control(&node, "tasks", &pid_str);
            }
        }

        if limits.pids_max() > 0 {
            let node = root.join("pids").join(name);
            if create_node(&node).is_ok() {
                write_control(&node, "pids.max", &limits.pids_max().to_string());
                write_control(&node, "tasks", &pid_str);
            }
        }
        Ok(())
    }

    /// Removes the container's leaf node(s). Best-effort and idempotent:
    /// the only way removal can fail is the kernel still counting the group
    /// as non-empty, which means a live process upstream.
    pub fn cleanup(&self, name: &str) {
        for node in self.node_paths(name) {
            match fs::remove_dir(&node) {
                Ok(()) => debug!("removed cgroup node {}", node.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to remove cgroup node {}: {e}", node.display()),
            }
        }
    }
}

/// cgroup v1 shares (1024 = nominal) mapped onto the v2 weight scale.
pub fn shares_to_weight(shares: u64) -> u64 {
    ((shares * 10_000) / 1024).clamp(1, 10_000)
}

fn create_node(node: &Path) -> Result<()> {
    match fs::create_dir(node) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(anyhow!("creating cgroup node {}: {e}", node.display())),
    }
}

fn write_control(node: &Path, file: &str, value: &str) {
    let path = node.join(file);
    match fs::write(&path, value) {
        Ok(()) => debug!("wrote {} = {value}", path.display()),
        Err(e) => warn!("failed to write {} = {value}: {e}", path.display()),
    }
}
