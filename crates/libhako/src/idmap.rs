// crates/libhako/src/idmap.rs

use anyhow::{Context, Result};
use log::{info, warn};
use nix::unistd::{Gid, Pid, Uid, getgid, getuid};
use std::fs;
use std::path::Path;

/// The invoking user's real UID, seen through a `sudo` wrapper if there is
/// one. No host root is required for the mapping itself.
pub fn real_uid() -> Uid {
    match std::env::var("SUDO_UID").ok().and_then(|v| v.parse::<u32>().ok()) {
        Some(uid) => Uid::from_raw(uid),
        None => getuid(),
    }
}

pub fn real_gid() -> Gid {
    match std::env::var("SUDO_GID").ok().and_then(|v| v.parse::<u32>().ok()) {
        Some(gid) => Gid::from_raw(gid),
        None => getgid(),
    }
}

/// Maps in-container root onto the invoking host user for a child that sits
/// in a fresh user namespace.
///
/// The child must not change its credentials to (0,0) until these writes
/// have completed; the caller's rendezvous enforces that ordering.
pub fn map_container_root(pid: Pid) -> Result<()> {
    map_ids_at(Path::new("/proc"), pid, real_uid(), real_gid())
}

/// Same as [`map_container_root`] but against an explicit proc root, so the
/// write protocol is testable without a live namespace.
pub fn map_ids_at(proc_root: &Path, pid: Pid, uid: Uid, gid: Gid) -> Result<()> {
    let pid_dir = proc_root.join(pid.to_string());

    // Denying setgroups is mandatory for unprivileged user namespaces;
    // without it the kernel refuses the gid_map write below.
    if let Err(e) = fs::write(pid_dir.join("setgroups"), "deny") {
        warn!("failed to deny setgroups for pid {pid}: {e}");
    }

    // Each map file accepts exactly one write.
    fs::write(pid_dir.join("uid_map"), format!("0 {uid} 1\n"))
        .with_context(|| format!("writing uid_map for pid {pid}"))?;
    fs::write(pid_dir.join("gid_map"), format!("0 {gid} 1\n"))
        .with_context(|| format!("writing gid_map for pid {pid}"))?;

    info!("mapped container root to host {uid}:{gid} for pid {pid}");
    Ok(())
}
