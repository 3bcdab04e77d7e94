//! Mount staging for the container's private namespace.
//!
//! Everything here runs in the child. The kernel allows some mounts only on
//! host paths before the root change and others only from inside, so the
//! work is split around the pivot: device binds, devpts and the synthetic
//! meminfo staging happen against `<container_root>`, then `chroot`, then
//! proc/sys and the meminfo bind happen on container-internal paths. Apart
//! from the pivot itself every step degrades to a warning so the guest
//! shell still comes up.

use crate::limits::LimitSpec;
use anyhow::{Context, Result};
use log::{debug, warn};
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sys::stat::{Mode, SFlag, makedev, mknod};
use nix::unistd::{chdir, chroot};
use std::fmt::Write as _;
use std::fs;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::Path;

/// Host device files bound into the container before the root change.
const HOST_BIND_DEVICES: [&str; 6] = [
    "/dev/null",
    "/dev/zero",
    "/dev/random",
    "/dev/urandom",
    "/dev/tty",
    "/dev/console",
];

/// Essential character devices, for when devtmpfs is refused and nodes have
/// to be created by hand.
const DEVICE_NODES: [(&str, u64, u64, u32); 7] = [
    ("null", 1, 3, 0o666),
    ("zero", 1, 5, 0o666),
    ("full", 1, 7, 0o666),
    ("random", 1, 8, 0o666),
    ("urandom", 1, 9, 0o666),
    ("tty", 5, 0, 0o666),
    ("console", 5, 1, 0o600),
];

const DEVPTS_DATA: &str = "ptmxmode=0666,newinstance";

/// Where the synthetic meminfo is staged, as seen from inside the container.
const MEMINFO_STAGE: &str = "/tmp/meminfo.custom";

/// Stages everything that must be mounted on host-visible paths while the
/// container root is still reachable from outside.
pub fn stage_pre_pivot(root: &Path, limits: &LimitSpec) {
    bind_host_devices(root);

    if limits.memory_bytes() > 0 {
        stage_meminfo(root, limits.memory_bytes());
    }

    mount_dev(root);
    mount_devpts(&root.join("dev/pts"));
    link_ptmx(&root.join("dev/ptmx"));
}

/// The root change itself. The one fatal step of the mount sequence.
pub fn enter_root(root: &Path) -> Result<()> {
    chroot(root).with_context(|| format!("chroot to {}", root.display()))?;
    chdir("/").context("chdir to new root")?;
    Ok(())
}

/// Completes the topology from inside the new root.
pub fn finish_post_pivot(limits: &LimitSpec) {
    if let Err(e) = mount(Some("proc"), "/proc", Some("proc"), MsFlags::empty(), None::<&str>) {
        warn!("cannot mount /proc ({e}); process-inspection tools may misbehave");
    }
    if let Err(e) = mount(Some("sysfs"), "/sys", Some("sysfs"), MsFlags::empty(), None::<&str>) {
        warn!("cannot mount /sys ({e})");
    }

    // Remount devpts so a live pty master survives the root change.
    let _ = umount2("/dev/pts", MntFlags::MNT_DETACH);
    let _ = fs::create_dir_all("/dev/pts");
    mount_devpts(Path::new("/dev/pts"));
    link_ptmx(Path::new("/dev/ptmx"));

    write_dpkg_format_markers();

    if limits.memory_bytes() > 0 {
        bind_meminfo();
    }
}

fn bind_host_devices(root: &Path) {
    for device in HOST_BIND_DEVICES {
        let target = root.join(device.trim_start_matches('/'));
        // The bind replaces an empty regular file.
        if let Err(e) = fs::write(&target, b"") {
            warn!("cannot create bind target {}: {e}", target.display());
            continue;
        }
        match mount(Some(device), &target, None::<&str>, MsFlags::MS_BIND, None::<&str>) {
            Ok(()) => {
                let _ = fs::set_permissions(&target, fs::Permissions::from_mode(0o666));
            }
            Err(e) => warn!("cannot bind {device} into container: {e}"),
        }
    }
}

fn mount_dev(root: &Path) {
    let dev = root.join("dev");
    let _ = fs::create_dir_all(&dev);
    if mount(Some("devtmpfs"), &dev, Some("devtmpfs"), MsFlags::empty(), None::<&str>).is_err() {
        // Typical inside a user namespace; fall back to manual nodes.
        debug!("devtmpfs refused, creating device nodes manually");
        create_device_nodes(&dev);
    }
}

pub(crate) fn create_device_nodes(dev: &Path) {
    for (name, major, minor, mode) in DEVICE_NODES {
        let node = dev.join(name);
        let _ = fs::remove_file(&node);
        match mknod(
            &node,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(mode),
            makedev(major, minor),
        ) {
            // mknod is commonly refused for unprivileged users; the host
            // binds already cover the devices the shell needs.
            Ok(()) => {
                let _ = fs::set_permissions(&node, fs::Permissions::from_mode(mode));
            }
            Err(e) => debug!("mknod {} failed: {e}", node.display()),
        }
    }
}

fn mount_devpts(target: &Path) {
    let _ = fs::create_dir_all(target);
    let fresh = mount(
        Some("devpts"),
        target,
        Some("devpts"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some(DEVPTS_DATA),
    );
    if fresh.is_err()
        && let Err(e) = mount(
            Some("devpts"),
            target,
            Some("devpts"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            None::<&str>,
        )
    {
        warn!("cannot mount devpts at {}: {e}", target.display());
    }
}

fn link_ptmx(link: &Path) {
    let _ = fs::remove_file(link);
    if let Err(e) = symlink("/dev/pts/ptmx", link) {
        warn!("cannot link {}: {e}", link.display());
    }
}

fn stage_meminfo(root: &Path, memory_bytes: u64) {
    let tmp = root.join("tmp");
    let _ = fs::create_dir_all(&tmp);
    let _ = fs::set_permissions(&tmp, fs::Permissions::from_mode(0o1777));

    let staged = root.join(MEMINFO_STAGE.trim_start_matches('/'));
    if let Err(e) = fs::write(&staged, render_meminfo(memory_bytes)) {
        warn!("cannot stage synthetic meminfo: {e}");
    }
}

fn bind_meminfo() {
    if !Path::new(MEMINFO_STAGE).exists() {
        warn!("staged meminfo missing; free(1) will report host memory");
        return;
    }
    if let Err(e) = mount(
        Some(MEMINFO_STAGE),
        "/proc/meminfo",
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    ) {
        // Cosmetic only: the cgroup ceiling stays authoritative.
        warn!("cannot bind synthetic meminfo over /proc/meminfo: {e}");
    }
}

/// dpkg refuses to run without its database format markers; the overlay
/// upper layer starts without them.
fn write_dpkg_format_markers() {
    let _ = fs::create_dir_all("/var/lib/dpkg/info");
    for name in ["format", "format-new"] {
        let path = Path::new("/var/lib/dpkg/info").join(name);
        let _ = fs::remove_file(&path);
        if fs::write(&path, "2.0\n").is_ok() {
            let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o644));
        }
    }
}

/// A meminfo text reflecting the memory ceiling, for tools that read
/// `/proc/meminfo` instead of the cgroup files. Free/available/cache lines
/// carry fixed proportions of the ceiling; swap is absent by construction.
pub fn render_meminfo(memory_bytes: u64) -> String {
    let total_kb = memory_bytes / 1024;
    let free_kb = total_kb * 80 / 100;
    let available_kb = total_kb * 75 / 100;
    let cached_kb = total_kb * 15 / 100;
    let buffers_kb = total_kb * 5 / 100;

    let mut out = String::new();
    let mut line = |label: &str, kb: u64| {
        let _ = writeln!(out, "{label:<16}{kb:>8} kB");
    };
    line("MemTotal:", total_kb);
    line("MemFree:", free_kb);
    line("MemAvailable:", available_kb);
    line("Buffers:", buffers_kb);
    line("Cached:", cached_kb);
    line("SwapCached:", 0);
    line("Active:", total_kb - free_kb);
    line("Inactive:", 0);
    line("SwapTotal:", 0);
    line("SwapFree:", 0);
    line("Dirty:", 0);
    line("Writeback:", 0);
    line("Shmem:", 0);
    line("Slab:", 0);
    line("SReclaimable:", 0);
    line("SUnreclaim:", 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_reflects_ceiling() {
        let text = render_meminfo(512 * 1024 * 1024);
        let total = text.lines().find(|l| l.starts_with("MemTotal:")).unwrap();
        assert_eq!(total, "MemTotal:         524288 kB");
        assert!(text.contains("SwapTotal:             0 kB"));
    }

    #[test]
    fn meminfo_free_is_a_fraction_of_total() {
        let text = render_meminfo(1024 * 1024 * 1024);
        let kb = |label: &str| -> u64 {
            text.lines()
                .find(|l| l.starts_with(label))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|v| v.parse().ok())
                .unwrap()
        };
        assert_eq!(kb("MemTotal:"), 1_048_576);
        assert_eq!(kb("MemFree:"), 1_048_576 * 80 / 100);
        assert_eq!(kb("MemAvailable:"), 1_048_576 * 75 / 100);
        assert_eq!(kb("Active:"), kb("MemTotal:") - kb("MemFree:"));
    }
}
