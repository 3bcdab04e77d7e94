// crates/libhako/src/container.rs

//! Container lifecycle orchestration.
//!
//! One parent, one child, one pipe. The child is placed into fresh PID,
//! mount, UTS, IPC and user namespaces by a single clone call and
//! immediately blocks on the read end of the pipe. The parent then writes
//! the identity maps and attaches the cgroup (work that must happen from
//! outside the namespaces) and closes its write end, which is the go
//! signal. Only after that EOF does the child assume uid/gid 0, build its
//! rootfs, stage the mount topology and exec the guest shell. Collapsing
//! the rendezvous into a sleep would race the credential change against
//! the map writes; the pipe is the ordering.

use crate::cgroup::CgroupLayout;
use crate::config::Config;
use crate::idmap;
use crate::image::BaseImage;
use crate::limits::LimitSpec;
use crate::mounts;
use crate::rootfs::ContainerRootfs;
use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use nix::sched::{CloneFlags, clone};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{Gid, Pid, Uid, pipe, read, sethostname, setgid, setuid};
use std::ffi::CString;
use std::fmt;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

const STACK_SIZE: usize = 1024 * 1024;

/// Launch-time identity, unique enough among live containers on one host.
/// Derived names are created with create_dir, so an actual collision still
/// fails loudly instead of sharing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerId(u32);

impl ContainerId {
    pub fn allocate() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let pid = std::process::id() as u64;
        Self(((now % 100_000) + (pid % 1000)) as u32)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parent-side ownership of one running container: the child pid plus every
/// artefact that must disappear when it exits.
struct ContainerHandle<'a> {
    id: ContainerId,
    child: Pid,
    limits: &'a LimitSpec,
    layout: &'a CgroupLayout,
    cgroup_name: String,
    rootfs: ContainerRootfs,
}

impl ContainerHandle<'_> {
    /// Reaps the guest and releases the cgroup node and writable layers.
    /// Cleanup is idempotent and runs no matter how the child died.
    fn wait_and_clean(self) -> i32 {
        let code = match waitpid(self.child, None) {
            Ok(WaitStatus::Exited(_, code)) => code,
            Ok(WaitStatus::Signaled(_, signal, _)) => 128 + signal as i32,
            Ok(other) => {
                warn!("unexpected wait status for container {}: {other:?}", self.id);
                1
            }
            Err(e) => {
                warn!("waitpid for container {} failed: {e}", self.id);
                1
            }
        };
        info!("container {} exited with status {code}", self.id);

        self.layout.cleanup(&self.cgroup_name);
        self.rootfs.teardown();
        debug!("container {} cleaned up", self.id);
        code
    }
}

/// Runs one container to completion and returns the guest's exit status.
///
/// The base image must already exist; building it is the caller's decision
/// because it is interactive on first run.
pub fn run(config: &Config, layout: &CgroupLayout) -> Result<i32> {
    let image = BaseImage::at(&config.base_image);
    if !image.is_ready() {
        bail!("base image at {} is not built", config.base_image.display());
    }

    let id = ContainerId::allocate();
    let cgroup_name = format!("{}{}", config.cgroup_name_prefix, id);
    let root = PathBuf::from(format!("{}{}", config.container_root_prefix, id));
    let rootfs = ContainerRootfs::at(root, config.rootfs_mode);
    info!("starting container {id} (root {})", rootfs.root().display());

    let (sync_read, sync_write) = pipe().context("creating rendezvous pipe")?;
    let sync_write_raw = sync_write.as_raw_fd();

    let mut stack = vec![0u8; STACK_SIZE];
    let flags = CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWUSER;

    let child_entry = Box::new(|| child_main(config, &rootfs, &sync_read, sync_write_raw));

    let child = unsafe { clone(child_entry, &mut stack, flags, Some(libc::SIGCHLD)) }
        .context("clone failed; cannot create container namespaces")?;
    debug!("container {id} spawned as pid {child}");

    // The read end belongs to the child from here on.
    drop(sync_read);

    let handle = ContainerHandle {
        id,
        child,
        limits: &config.limits,
        layout,
        cgroup_name,
        rootfs,
    };

    // The child is blocked on the pipe, so everything written here is
    // observable before it changes credentials or mounts anything.
    if let Err(e) = idmap::map_container_root(child) {
        warn!("user namespace mapping failed: {e}; container root may not behave as root");
    }
    if let Err(e) = handle.layout.attach(child, handle.limits, &handle.cgroup_name) {
        warn!("cgroup attach failed: {e}; limits will not apply");
    }

    // Closing the write end is the go signal.
    drop(sync_write);

    Ok(handle.wait_and_clean())
}

/// Everything the child does, from blocking on the rendezvous to exec.
/// Returns the child's exit status when exec cannot be reached.
fn child_main(
    config: &Config,
    rootfs: &ContainerRootfs,
    sync_read: &OwnedFd,
    inherited_write: RawFd,
) -> isize {
    // Drop the inherited write end or the parent's close never reads as EOF.
    let _ = unsafe { libc::close(inherited_write) };

    let mut buf = [0u8; 1];
    if let Err(e) = read(sync_read, &mut buf) {
        warn!("rendezvous read failed: {e}");
    }

    // The uid_map written by the parent makes (0,0) meaningful now.
    // gid first: after the uid changes we may no longer be allowed to.
    if let Err(e) = setgid(Gid::from_raw(0)) {
        log::error!("setgid(0) failed in container: {e}");
        return 1;
    }
    if let Err(e) = setuid(Uid::from_raw(0)) {
        log::error!("setuid(0) failed in container: {e}");
        return 1;
    }

    if let Err(e) = sethostname(&config.hostname) {
        warn!("failed to set container hostname: {e}");
    }

    if let Err(e) = rootfs.materialize(&config.base_image, &config.upper_dirs) {
        log::error!("cannot set up container filesystem: {e}");
        return 1;
    }

    mounts::stage_pre_pivot(rootfs.root(), &config.limits);
    if let Err(e) = mounts::enter_root(rootfs.root()) {
        log::error!("root change failed: {e}");
        return 1;
    }
    mounts::finish_post_pivot(&config.limits);

    // exec only returns on failure, which is terminal for the child.
    let e = exec_shell(config);
    log::error!("exec {} failed: {e}", config.shell.display());
    127
}

fn exec_shell(config: &Config) -> anyhow::Error {
    match shell_exec_args(config) {
        Ok((path, args, env)) => match nix::unistd::execve(&path, &args, &env) {
            Ok(infallible) => match infallible {},
            Err(e) => e.into(),
        },
        Err(e) => e,
    }
}

/// The guest environment: a standard search path, root's home, a prompt
/// that marks the container, and terminfo the base image provides.
fn shell_exec_args(config: &Config) -> Result<(CString, Vec<CString>, Vec<CString>)> {
    let shell = CString::new(config.shell.to_string_lossy().into_owned())
        .context("shell path contains a NUL byte")?;
    let args = vec![shell.clone(), CString::new("-i")?];
    let env = [
        "PATH=/bin:/usr/bin:/sbin:/usr/sbin",
        "HOME=/",
        "PS1=[hako] \\w # ",
        "TERM=xterm",
        "TERMINFO=/usr/share/terminfo:/lib/terminfo:/etc/terminfo",
    ]
    .into_iter()
    .map(CString::new)
    .collect::<Result<Vec<_>, _>>()?;
    Ok((shell, args, env))
}
