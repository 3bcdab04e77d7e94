// crates/libhako/src/config.rs

use crate::limits::LimitSpec;
use crate::rootfs::RootfsMode;
use serde::Deserialize;
use serde_with::{DisplayFromStr, serde_as};
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Runtime configuration. Every field has a default so the binary runs
/// without a config file; a JSON file overrides selectively.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Shared read-only base image; built once per host.
    #[serde_as(as = "DisplayFromStr")]
    pub base_image: PathBuf,
    /// Per-container roots are `<prefix><id>`, with `<prefix><id>_upper`
    /// and `<prefix><id>_work` alongside in overlay mode.
    pub container_root_prefix: String,
    pub cgroup_name_prefix: String,
    pub rootfs_mode: RootfsMode,
    /// Directories pre-created in the overlay upper layer so the guest can
    /// write to them from the start. Relative to the container root.
    pub upper_dirs: Vec<String>,
    pub hostname: String,
    #[serde_as(as = "DisplayFromStr")]
    pub shell: PathBuf,
    pub limits: LimitSpec,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_image: PathBuf::from("/tmp/hako_base_rootfs"),
            container_root_prefix: "/tmp/hako_root_".to_string(),
            cgroup_name_prefix: "hako_container_".to_string(),
            rootfs_mode: RootfsMode::Overlay,
            upper_dirs: vec![
                "tmp".to_string(),
                "var/lib/dpkg".to_string(),
                "var/lib/dpkg/info".to_string(),
                "var/lib/apt".to_string(),
            ],
            hostname: "container".to_string(),
            shell: PathBuf::from("/bin/bash"),
            limits: LimitSpec::default(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let cfg: Self = serde_json::from_reader(reader)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.base_image.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "base_image {:?} must be absolute",
                self.base_image
            )));
        }
        if !self.container_root_prefix.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "container_root_prefix {:?} must be absolute",
                self.container_root_prefix
            )));
        }
        if self.cgroup_name_prefix.is_empty() || self.cgroup_name_prefix.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "cgroup_name_prefix {:?} must be a single path component",
                self.cgroup_name_prefix
            )));
        }
        if !self.shell.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "shell {:?} must be absolute",
                self.shell
            )));
        }
        for dir in &self.upper_dirs {
            if dir.starts_with('/') || dir.contains("..") {
                return Err(ConfigError::Invalid(format!(
                    "upper_dirs entry {dir:?} must be relative and may not escape the root"
                )));
            }
        }
        Ok(())
    }
}
