// crates/libhako/src/rootfs.rs

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use serde::Deserialize;
use std::fs;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// How a container's writable view of the base image is materialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootfsMode {
    /// Recursive copy of the base image. Slow but always works; the
    /// fallback for the other two modes.
    Copy,
    /// Bind-mount of the base image. Instant, but the base is writable
    /// through the view, so only acceptable for read-only guests.
    Bind,
    /// Overlay mount with a per-container upper/work pair. Preferred.
    Overlay,
}

impl FromStr for RootfsMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "copy" => Ok(RootfsMode::Copy),
            "bind" => Ok(RootfsMode::Bind),
            "overlay" => Ok(RootfsMode::Overlay),
            other => Err(anyhow!("unknown rootfs mode {other:?} (expected copy, bind or overlay)")),
        }
    }
}

/// The per-container root and its overlay siblings. The upper and work
/// directories exist only for the container's lifetime.
#[derive(Debug)]
pub struct ContainerRootfs {
    root: PathBuf,
    upper: PathBuf,
    work: PathBuf,
    mode: RootfsMode,
}

impl ContainerRootfs {
    pub fn at(root: PathBuf, mode: RootfsMode) -> Self {
        let upper = PathBuf::from(format!("{}_upper", root.display()));
        let work = PathBuf::from(format!("{}_work", root.display()));
        Self {
            root,
            upper,
            work,
            mode,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn upper(&self) -> &Path {
        &self.upper
    }

    pub fn work(&self) -> &Path {
        &self.work
    }

    /// Builds the writable view over `base`. Runs in the child, inside its
    /// own mount namespace. Directory collisions fail loudly here: an
    /// already-existing root means another live container owns this id.
    pub fn materialize(&self, base: &Path, upper_dirs: &[String]) -> Result<()> {
        fs::create_dir(&self.root)
            .with_context(|| format!("creating container root {}", self.root.display()))?;

        match self.mode {
            RootfsMode::Overlay => self.materialize_overlay(base, upper_dirs)?,
            RootfsMode::Bind => self.materialize_bind(base)?,
            RootfsMode::Copy => copy_tree(base, &self.root)?,
        }

        // Namespace-private mount targets; harmless if the layer has them.
        for dir in ["proc", "sys", "dev/pts", "tmp"] {
            let _ = fs::create_dir_all(self.root.join(dir));
        }
        Ok(())
    }

    fn materialize_overlay(&self, base: &Path, upper_dirs: &[String]) -> Result<()> {
        fs::create_dir(&self.upper)
            .with_context(|| format!("creating upper layer {}", self.upper.display()))?;
        fs::create_dir(&self.work)
            .with_context(|| format!("creating work dir {}", self.work.display()))?;

        let data = format!(
            "lowerdir={},upperdir={},workdir={}",
            base.display(),
            self.upper.display(),
            self.work.display()
        );
        if let Err(e) = mount(
            Some("overlay"),
            &self.root,
            Some("overlay"),
            MsFlags::empty(),
            Some(data.as_str()),
        ) {
            warn!("overlay mount refused ({e}), falling back to a full copy");
            return copy_tree(base, &self.root);
        }

        // Touch-then-unlink probe: some kernels accept the mount and then
        // fail the first copy-up.
        let probe = self.root.join(".overlay_probe");
        let probe_ok = fs::write(&probe, b"").and_then(|()| fs::remove_file(&probe));
        if let Err(e) = probe_ok {
            warn!("overlay mounted but not writable ({e}), falling back to a full copy");
            let _ = umount2(&self.root, MntFlags::MNT_DETACH);
            return copy_tree(base, &self.root);
        }

        // Pre-create guest state directories in the upper layer so they are
        // writable from the first shell command.
        for dir in upper_dirs {
            if let Err(e) = fs::create_dir_all(self.root.join(dir)) {
                warn!("failed to pre-create {dir} in upper layer: {e}");
            }
        }
        let _ = fs::set_permissions(self.root.join("tmp"), fs::Permissions::from_mode(0o1777));

        info!("overlay rootfs ready at {}", self.root.display());
        Ok(())
    }

    fn materialize_bind(&self, base: &Path) -> Result<()> {
        if let Err(e) = mount(
            Some(base),
            &self.root,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        ) {
            warn!("bind mount of base image refused ({e}), falling back to a full copy");
            return copy_tree(base, &self.root);
        }
        info!("bind rootfs ready at {}", self.root.display());
        Ok(())
    }

    /// Removes the writable layers. Runs in the parent after reap, when the
    /// child's mount namespace is already gone; a lazy detach first keeps a
    /// leaked mount from turning removal into EBUSY. Idempotent.
    pub fn teardown(&self) {
        let _ = umount2(&self.root, MntFlags::MNT_DETACH);
        for path in [&self.root, &self.upper, &self.work] {
            match fs::remove_dir_all(path) {
                Ok(()) => debug!("removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to remove {}: {e}", path.display()),
            }
        }
    }
}

/// Recursive copy preserving file modes and symlinks, the native
/// counterpart of `cp -a` for the trees we manage. Special files (device
/// nodes in the base image's `/dev`) are skipped; the mount builder
/// recreates the essential ones inside the container.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let src_meta =
        fs::symlink_metadata(src).with_context(|| format!("reading {}", src.display()))?;
    fs::create_dir_all(dst).with_context(|| format!("creating {}", dst.display()))?;

    for entry in fs::read_dir(src).with_context(|| format!("listing {}", src.display()))? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&from)?;
            if to.symlink_metadata().is_ok() {
                let _ = fs::remove_file(&to);
            }
            symlink(&target, &to)
                .with_context(|| format!("linking {} -> {}", to.display(), target.display()))?;
        } else if file_type.is_file() {
            fs::copy(&from, &to)
                .with_context(|| format!("copying {} to {}", from.display(), to.display()))?;
        } else {
            debug!("skipping special file {}", from.display());
        }
    }

    fs::set_permissions(dst, src_meta.permissions())
        .with_context(|| format!("setting mode on {}", dst.display()))?;
    Ok(())
}
