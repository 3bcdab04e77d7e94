//! Base image construction and caching.
//!
//! The base image is a host directory tree assembled once and then shared
//! read-only by every container. A sentinel file marks a completed build;
//! later runs only check for it. Construction replicates a curated command
//! set from the host together with the shared objects each binary links
//! against, then lays down the handful of config files an interactive
//! shell expects. Missing host binaries are skipped silently: host
//! environments vary and the image is still usable without them.

use crate::elf;
use crate::rootfs::copy_tree;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

const READY_SENTINEL: &str = ".rootfs_ready";
const BUILD_LOCK: &str = ".build.lock";

/// Directory skeleton of the image.
const SKELETON_DIRS: [&str; 31] = [
    "bin",
    "sbin",
    "usr",
    "usr/bin",
    "usr/sbin",
    "usr/local",
    "usr/local/bin",
    "tmp",
    "dev",
    "dev/pts",
    "proc",
    "sys",
    "etc",
    "var",
    "var/tmp",
    "var/log",
    "lib",
    "lib64",
    "lib/x86_64-linux-gnu",
    "usr/lib",
    "usr/lib/x86_64-linux-gnu",
    "usr/share",
    "usr/share/terminfo",
    "usr/share/terminfo/l",
    "usr/share/terminfo/x",
    "usr/share/terminfo/v",
    "lib/terminfo",
    "lib/terminfo/l",
    "lib/terminfo/x",
    "lib/terminfo/v",
    "root",
];

/// Host binaries replicated into the image, with their in-image names.
/// Whatever the host doesn't have is skipped.
const DEFAULT_COMMANDS: [(&str, &str); 50] = [
    ("/bin/bash", "bash"),
    ("/bin/sh", "sh"),
    ("/bin/ls", "ls"),
    ("/bin/cat", "cat"),
    ("/bin/echo", "echo"),
    ("/bin/pwd", "pwd"),
    ("/bin/ps", "ps"),
    ("/bin/grep", "grep"),
    ("/bin/find", "find"),
    ("/bin/mkdir", "mkdir"),
    ("/bin/rmdir", "rmdir"),
    ("/bin/rm", "rm"),
    ("/bin/cp", "cp"),
    ("/bin/mv", "mv"),
    ("/bin/chmod", "chmod"),
    ("/bin/chown", "chown"),
    ("/bin/df", "df"),
    ("/bin/du", "du"),
    ("/bin/wc", "wc"),
    ("/bin/head", "head"),
    ("/bin/tail", "tail"),
    ("/bin/sort", "sort"),
    ("/bin/uniq", "uniq"),
    ("/bin/dd", "dd"),
    ("/bin/touch", "touch"),
    ("/usr/bin/yes", "yes"),
    ("/usr/bin/seq", "seq"),
    ("/usr/bin/bc", "bc"),
    ("/usr/bin/tr", "tr"),
    ("/usr/bin/awk", "awk"),
    ("/usr/bin/sed", "sed"),
    ("/usr/bin/id", "id"),
    ("/usr/bin/whoami", "whoami"),
    ("/usr/bin/which", "which"),
    ("/usr/bin/top", "top"),
    ("/usr/bin/htop", "htop"),
    ("/usr/bin/free", "free"),
    ("/usr/bin/uptime", "uptime"),
    ("/usr/bin/uname", "uname"),
    ("/usr/bin/sleep", "sleep"),
    ("/usr/bin/env", "env"),
    ("/usr/bin/less", "less"),
    ("/usr/bin/clear", "clear"),
    ("/usr/bin/more", "more"),
    ("/usr/bin/vim", "vim"),
    ("/usr/bin/nano", "nano"),
    ("/usr/bin/curl", "curl"),
    ("/usr/bin/wget", "wget"),
    ("/bin/tar", "tar"),
    ("/bin/gzip", "gzip"),
];

/// Host terminfo locations mirrored into the image so TERM=xterm works.
const TERMINFO_TREES: [&str; 3] = ["/lib/terminfo", "/etc/terminfo", "/usr/share/terminfo"];

pub struct BaseImage {
    root: PathBuf,
}

impl BaseImage {
    pub fn at<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A build is complete iff the sentinel exists inside the tree.
    pub fn is_ready(&self) -> bool {
        self.root.is_dir() && self.root.join(READY_SENTINEL).is_file()
    }

    pub fn build(&self) -> Result<()> {
        self.build_with(&DEFAULT_COMMANDS)
    }

    /// Builds the image from an explicit command table. Idempotent:
    /// re-running over an existing tree overwrites rather than corrupts.
    /// Concurrent first runs serialise on an flock next to the sentinel;
    /// the loser finds the sentinel and skips the rebuild.
    pub fn build_with(&self, commands: &[(&str, &str)]) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating base image root {}", self.root.display()))?;
        let _lock = BuildLock::acquire(&self.root.join(BUILD_LOCK))?;
        if self.is_ready() {
            info!("base image already built at {}", self.root.display());
            return Ok(());
        }

        info!("building base image at {} (first run only)", self.root.display());

        for dir in SKELETON_DIRS {
            let _ = fs::create_dir_all(self.root.join(dir));
        }

        let mut installed = 0;
        for (source, name) in commands {
            if !Path::new(source).is_file() {
                continue;
            }
            match self.install_binary(Path::new(source), name) {
                Ok(()) => installed += 1,
                Err(e) => warn!("failed to install {source}: {e}"),
            }
        }
        info!("installed {installed} commands");

        self.write_system_files()?;
        self.copy_terminfo();
        crate::mounts::create_device_nodes(&self.root.join("dev"));
        self.write_shell_profile()?;
        self.install_vim_runtime();

        fs::write(
            self.root.join(READY_SENTINEL),
            "Base rootfs created successfully\n",
        )
        .context("writing base image sentinel")?;
        info!("base image ready at {}", self.root.display());
        Ok(())
    }

    /// Copies one binary into `/bin` plus the transitive library closure it
    /// links against, each at its host path inside the image.
    fn install_binary(&self, source: &Path, name: &str) -> Result<()> {
        let dest = self.root.join("bin").join(name);
        fs::copy(source, &dest)
            .with_context(|| format!("copying {} to {}", source.display(), dest.display()))?;

        for lib in elf::library_closure(source)? {
            let target = self.root.join(lib.strip_prefix("/").unwrap_or(&lib));
            if let Some(parent) = target.parent() {
                let _ = fs::create_dir_all(parent);
            }
            if let Err(e) = fs::copy(&lib, &target) {
                warn!("failed to copy {}: {e}", lib.display());
            }
        }
        Ok(())
    }

    fn write_system_files(&self) -> Result<()> {
        fs::write(
            self.root.join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/bash\n\
             nobody:x:65534:65534:nobody:/nonexistent:/usr/sbin/nologin\n",
        )
        .context("writing /etc/passwd")?;
        fs::write(self.root.join("etc/group"), "root:x:0:\nnogroup:x:65534:\n")
            .context("writing /etc/group")?;
        fs::write(self.root.join("etc/hostname"), "container\n").context("writing /etc/hostname")?;
        Ok(())
    }

    fn copy_terminfo(&self) {
        for tree in TERMINFO_TREES {
            let source = Path::new(tree);
            if !source.is_dir() {
                continue;
            }
            let target = self.root.join(tree.trim_start_matches('/'));
            if let Err(e) = copy_tree(source, &target) {
                debug!("terminfo copy from {tree} incomplete: {e}");
            }
        }
    }

    fn write_shell_profile(&self) -> Result<()> {
        fs::write(
            self.root.join("etc/bash.bashrc"),
            "alias ll=\"ls -la\"\n\
             export TERM=xterm\n\
             export TERMINFO=/usr/share/terminfo:/lib/terminfo:/etc/terminfo\n",
        )
        .context("writing /etc/bash.bashrc")
    }

    fn install_vim_runtime(&self) {
        let host_vim = Path::new("/usr/share/vim");
        if host_vim.is_dir()
            && let Err(e) = copy_tree(host_vim, &self.root.join("usr/share/vim"))
        {
            debug!("vim runtime copy incomplete: {e}");
        }

        let vimrc = "set nocompatible\nset backspace=indent,eol,start\nsyntax on\n\
                     set background=dark\nset number\n";
        let _ = fs::create_dir_all(self.root.join("etc/vim"));
        let _ = fs::write(self.root.join("etc/vim/vimrc"), vimrc);
        let _ = fs::write(
            self.root.join("root/.vimrc"),
            "set nocompatible\nset backspace=indent,eol,start\n",
        );
    }
}

/// Exclusive flock held for the duration of a build. Released on drop.
struct BuildLock {
    _file: File,
}

impl BuildLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("opening build lock {}", path.display()))?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("locking {}", path.display()));
        }
        Ok(Self { _file: file })
    }
}
