use libhako::Config;
use libhako::config::ConfigError;
use libhako::rootfs::RootfsMode;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_are_valid_and_overlay_first() {
        let config = Config::default();
        config.validate().expect("defaults must validate");
        assert_eq!(config.rootfs_mode, RootfsMode::Overlay);
        assert_eq!(config.base_image, PathBuf::from("/tmp/hako_base_rootfs"));
        assert!(config.upper_dirs.iter().any(|d| d == "tmp"));
        assert!(config.limits.is_unlimited());
    }

    #[test]
    fn loads_partial_json_over_defaults() {
        let config = r#"
        {
            "base_image": "/var/lib/hako/base",
            "rootfs_mode": "copy",
            "limits": {
                "memory_bytes": 536870912,
                "pids_max": 100
            }
        }"#;

        let mut file = NamedTempFile::new().expect("Failed to create temp file.");
        write!(file, "{config}").expect("Failed to write to temp file");
        file.flush().expect("Failed to flush");

        let cfg = Config::load(file.path()).expect("Failed to parse config.");
        assert_eq!(cfg.base_image, PathBuf::from("/var/lib/hako/base"));
        assert_eq!(cfg.rootfs_mode, RootfsMode::Copy);
        assert_eq!(cfg.limits.memory_bytes(), 536870912);
        assert_eq!(cfg.limits.pids_max(), 100);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.hostname, "container");
        assert_eq!(cfg.shell, PathBuf::from("/bin/bash"));
    }

    #[test]
    fn rejects_unknown_fields() {
        let mut file = NamedTempFile::new().expect("Failed to create temp file.");
        write!(file, r#"{{"memory": "512M"}}"#).unwrap();
        file.flush().unwrap();
        assert!(matches!(Config::load(file.path()), Err(ConfigError::Json(_))));
    }

    #[test]
    fn rejects_relative_prefixes() {
        let mut config = Config::default();
        config.container_root_prefix = "relative/prefix_".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_escaping_upper_dirs() {
        let mut config = Config::default();
        config.upper_dirs = vec!["../outside".to_string()];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.upper_dirs = vec!["/absolute".to_string()];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn mode_parses_from_cli_strings() {
        assert_eq!("overlay".parse::<RootfsMode>().unwrap(), RootfsMode::Overlay);
        assert_eq!("copy".parse::<RootfsMode>().unwrap(), RootfsMode::Copy);
        assert_eq!("bind".parse::<RootfsMode>().unwrap(), RootfsMode::Bind);
        assert!("squashfs".parse::<RootfsMode>().is_err());
    }
}
