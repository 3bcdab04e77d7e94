use libhako::image::BaseImage;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn listing(root: &Path) -> BTreeSet<PathBuf> {
        fn walk(dir: &Path, root: &Path, out: &mut BTreeSet<PathBuf>) {
            for entry in fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                out.insert(path.strip_prefix(root).unwrap().to_path_buf());
                if path.is_dir() && !path.is_symlink() {
                    walk(&path, root, out);
                }
            }
        }
        let mut out = BTreeSet::new();
        walk(root, root, &mut out);
        out
    }

    #[test]
    fn unbuilt_image_is_not_ready() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let image = BaseImage::at(temp.path().join("base"));
        assert!(!image.is_ready());

        // A directory without the sentinel is still not a valid image.
        fs::create_dir_all(temp.path().join("base")).unwrap();
        assert!(!image.is_ready());
    }

    #[test]
    fn build_creates_skeleton_system_files_and_sentinel() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let image = BaseImage::at(temp.path().join("base"));
        image.build_with(&[]).expect("build should succeed");

        assert!(image.is_ready());
        for dir in ["bin", "etc", "dev", "proc", "sys", "tmp", "usr/share/terminfo"] {
            assert!(image.root().join(dir).is_dir(), "{dir} should exist");
        }

        let passwd = fs::read_to_string(image.root().join("etc/passwd")).unwrap();
        assert!(passwd.starts_with("root:x:0:0:"));
        assert!(passwd.contains("nobody:x:65534:"));
        let group = fs::read_to_string(image.root().join("etc/group")).unwrap();
        assert!(group.starts_with("root:x:0:"));
        assert_eq!(
            fs::read_to_string(image.root().join("etc/hostname")).unwrap(),
            "container\n"
        );
        let bashrc = fs::read_to_string(image.root().join("etc/bash.bashrc")).unwrap();
        assert!(bashrc.contains("TERM=xterm"));
        assert!(bashrc.contains("TERMINFO=/usr/share/terminfo"));
    }

    #[test]
    fn build_replicates_listed_binaries() {
        let temp = TempDir::new().expect("Failed to create temp dir");

        // A fake host binary: a plain file works because non-ELF content
        // has an empty library closure.
        let host_bin = temp.path().join("hostbin");
        fs::write(&host_bin, "#!/bin/sh\n").unwrap();
        let host_path = host_bin.to_str().unwrap().to_string();

        let image = BaseImage::at(temp.path().join("base"));
        image
            .build_with(&[(host_path.as_str(), "demo"), ("/nonexistent/tool", "ghost")])
            .expect("build should succeed");

        // Present binaries are installed under /bin; missing ones are
        // skipped silently.
        assert!(image.root().join("bin/demo").is_file());
        assert!(!image.root().join("bin/ghost").exists());
    }

    #[test]
    fn build_is_idempotent() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let image = BaseImage::at(temp.path().join("base"));

        image.build_with(&[]).expect("first build should succeed");
        let before = listing(image.root());
        let passwd_before = fs::read_to_string(image.root().join("etc/passwd")).unwrap();

        image.build_with(&[]).expect("second build should succeed");
        let after = listing(image.root());
        let passwd_after = fs::read_to_string(image.root().join("etc/passwd")).unwrap();

        assert_eq!(before, after);
        assert_eq!(passwd_before, passwd_after);
        assert!(image.is_ready());
    }

    #[test]
    fn second_build_skips_when_sentinel_present() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let image = BaseImage::at(temp.path().join("base"));
        image.build_with(&[]).expect("build should succeed");

        // A marker file would be destroyed by a real rebuild of /etc; the
        // sentinel short-circuit must leave the tree alone.
        fs::write(image.root().join("etc/passwd"), "marker\n").unwrap();
        image.build_with(&[]).expect("no-op build should succeed");
        assert_eq!(
            fs::read_to_string(image.root().join("etc/passwd")).unwrap(),
            "marker\n"
        );
    }
}
